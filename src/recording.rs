use crate::config::RecordingConfig;
use crate::error::RecordingError;
use crate::frame::{LatestFrame, VideoFrame};
use crate::journal::Journal;
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Codec preference order for the sink.
pub const PREFERRED_CODEC: &str = "avc1";
pub const FALLBACK_CODEC: &str = "mp4v";

/// Sink for encoded recording output. Encoding itself lives behind this
/// boundary; the recorder only paces frames into it.
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), RecordingError>;

    fn finish(&mut self) -> Result<(), RecordingError>;
}

pub trait SinkFactory: Send + Sync {
    /// Open a sink at `path` for the given codec and frame geometry. The
    /// recorder calls this lazily, once the first frame's size is known.
    fn open(
        &self,
        path: &Path,
        codec: &str,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>, RecordingError>;
}

/// Default sink: concatenated JPEG frames written straight to disk. Players
/// treat the result as an MJPEG elementary stream.
pub struct MjpegSinkFactory;

impl SinkFactory for MjpegSinkFactory {
    fn open(
        &self,
        path: &Path,
        _codec: &str,
        _fps: f64,
        _width: u32,
        _height: u32,
    ) -> Result<Box<dyn VideoSink>, RecordingError> {
        let file = fs::File::create(path).map_err(|e| RecordingError::SinkOpen {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        Ok(Box::new(MjpegFileSink {
            writer: BufWriter::new(file),
        }))
    }
}

struct MjpegFileSink {
    writer: BufWriter<fs::File>,
}

impl VideoSink for MjpegFileSink {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), RecordingError> {
        self.writer
            .write_all(&frame.jpeg)
            .map_err(|e| RecordingError::SinkWrite {
                details: e.to_string(),
            })
    }

    fn finish(&mut self) -> Result<(), RecordingError> {
        self.writer.flush().map_err(RecordingError::from)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub active: bool,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    pub total_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingFile {
    pub filename: String,
    pub size_bytes: u64,
    pub created: DateTime<Utc>,
}

#[derive(Debug)]
struct RecorderState {
    active: bool,
    started_at: Option<Instant>,
    current_file: Option<String>,
    // Distinguishes the session a capture task belongs to, so a stale task
    // finishing cannot clobber a newer session's state.
    generation: u64,
    // Per-session stop flag; a new session gets a fresh one so a stale
    // worker still draining cannot be confused with the new session.
    stop_flag: Arc<AtomicBool>,
}

/// Bounded-duration threat recorder. At most one session at a time: `start`
/// is a no-op while a session is active, `stop` is idempotent.
pub struct Recorder {
    config: RecordingConfig,
    latest: LatestFrame,
    sink_factory: Arc<dyn SinkFactory>,
    journal: Arc<Journal>,
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    pub fn new(
        config: RecordingConfig,
        latest: LatestFrame,
        sink_factory: Arc<dyn SinkFactory>,
        journal: Arc<Journal>,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(&config.path)?;
        Ok(Self {
            config,
            latest,
            sink_factory,
            journal,
            state: Arc::new(Mutex::new(RecorderState {
                active: false,
                started_at: None,
                current_file: None,
                generation: 0,
                stop_flag: Arc::new(AtomicBool::new(false)),
            })),
        })
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Begin a session unless one is already running. Returns false (and does
    /// nothing) while active.
    pub fn start(&self, reason: &str) -> bool {
        let (generation, filename, stop_flag) = {
            let mut state = self.state.lock();
            if state.active {
                return false;
            }
            state.active = true;
            state.started_at = Some(Instant::now());
            state.generation += 1;
            state.stop_flag = Arc::new(AtomicBool::new(false));

            let filename = format!(
                "threat_recording_{}.mp4",
                Local::now().format("%Y%m%d_%H%M%S")
            );
            state.current_file = Some(filename.clone());
            (state.generation, filename, Arc::clone(&state.stop_flag))
        };

        self.journal.record(
            "RECORDING",
            format!("Recording started ({}): {}", reason, filename),
        );

        let path = PathBuf::from(&self.config.path).join(&filename);
        let worker = CaptureWorker {
            config: self.config.clone(),
            latest: self.latest.clone(),
            sink_factory: Arc::clone(&self.sink_factory),
            journal: Arc::clone(&self.journal),
            state: Arc::clone(&self.state),
            stop_flag,
            generation,
            path,
            filename,
        };
        tokio::spawn(worker.run());
        true
    }

    /// Request the active session to end. Idempotent; the capture task
    /// observes the flag within one write tick.
    pub fn stop(&self) -> bool {
        let was_active = {
            let mut state = self.state.lock();
            let was = state.active;
            state.active = false;
            state.stop_flag.store(true, Ordering::SeqCst);
            was
        };
        if was_active {
            self.journal.record("RECORDING", "Recording stop requested");
        }
        was_active
    }

    pub fn status(&self) -> RecordingStatus {
        let state = self.state.lock();
        let elapsed = state
            .started_at
            .filter(|_| state.active)
            .map_or(0.0, |at| at.elapsed().as_secs_f64());
        let total = self.config.duration_secs;
        RecordingStatus {
            active: state.active,
            elapsed_secs: elapsed,
            remaining_secs: (total as f64 - elapsed).max(0.0),
            total_secs: total,
            file: state.active.then(|| state.current_file.clone()).flatten(),
        }
    }

    /// Completed recordings on disk, newest first.
    pub fn list_recordings(&self) -> std::io::Result<Vec<RecordingFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.config.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".mp4") {
                continue;
            }
            let meta = entry.metadata()?;
            let created = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(RecordingFile {
                filename: name,
                size_bytes: meta.len(),
                created,
            });
        }
        files.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(files)
    }

    pub fn recordings_dir(&self) -> &str {
        &self.config.path
    }
}

struct CaptureWorker {
    config: RecordingConfig,
    latest: LatestFrame,
    sink_factory: Arc<dyn SinkFactory>,
    journal: Arc<Journal>,
    state: Arc<Mutex<RecorderState>>,
    stop_flag: Arc<AtomicBool>,
    generation: u64,
    path: PathBuf,
    filename: String,
}

impl CaptureWorker {
    async fn run(self) {
        let deadline = Instant::now() + self.config.duration();
        let mut interval = tokio::time::interval(self.config.write_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut sink: Option<Box<dyn VideoSink>> = None;
        let mut frames_written: u64 = 0;
        let mut aborted = false;

        loop {
            interval.tick().await;

            if self.stop_flag.load(Ordering::SeqCst) || Instant::now() >= deadline {
                break;
            }

            // No frame yet (engine warming up, or mid-failover): skip the tick.
            let Some(frame) = self.latest.snapshot() else {
                continue;
            };

            if sink.is_none() {
                match self.open_sink(&frame) {
                    Ok(opened) => sink = Some(opened),
                    Err(e) => {
                        error!("Recording aborted, no usable sink: {}", e);
                        self.journal
                            .record("RECORDING", format!("Recording aborted: {}", e));
                        aborted = true;
                        break;
                    }
                }
            }

            if let Some(sink) = sink.as_mut() {
                if let Err(e) = sink.write_frame(&frame) {
                    error!("Recording aborted on write failure: {}", e);
                    self.journal
                        .record("RECORDING", format!("Recording aborted: {}", e));
                    aborted = true;
                    break;
                }
                frames_written += 1;
            }
        }

        if let Some(mut sink) = sink {
            if let Err(e) = sink.finish() {
                warn!("Failed to finalize recording {}: {}", self.filename, e);
            }
        }

        {
            let mut state = self.state.lock();
            if state.generation == self.generation {
                state.active = false;
            }
        }

        if !aborted {
            info!(
                "Recording finished: {} ({} frames)",
                self.filename, frames_written
            );
            self.journal.record(
                "RECORDING",
                format!(
                    "Recording saved: {} ({} frames)",
                    self.filename, frames_written
                ),
            );
        }
    }

    /// Open the sink with the preferred codec, falling back once.
    fn open_sink(&self, frame: &VideoFrame) -> Result<Box<dyn VideoSink>, RecordingError> {
        match self.sink_factory.open(
            &self.path,
            PREFERRED_CODEC,
            self.config.fps,
            frame.width,
            frame.height,
        ) {
            Ok(sink) => Ok(sink),
            Err(first) => {
                warn!(
                    "Codec {} unavailable ({}), trying {}",
                    PREFERRED_CODEC, first, FALLBACK_CODEC
                );
                self.sink_factory
                    .open(
                        &self.path,
                        FALLBACK_CODEC,
                        self.config.fps,
                        frame.width,
                        frame.height,
                    )
                    .map_err(|_| RecordingError::NoCodec {
                        preferred: PREFERRED_CODEC.to_string(),
                        fallback: FALLBACK_CODEC.to_string(),
                    })
            }
        }
    }
}
