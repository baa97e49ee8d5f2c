use crate::blackout::BlackoutDetector;
use crate::config::{BlackoutConfig, ThreatConfig};
use crate::failover::SwitchReason;
use crate::frame::{LatestFrame, Prediction, VideoFrame};
use crate::journal::{AlertBook, AlertSeverity, Journal};
use crate::probe::HealthSnapshot;
use crate::recording::Recorder;
use crate::threat::ThreatWindow;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Span of frame timestamps the rolling fps estimate is computed over.
const FPS_WINDOW: Duration = Duration::from_secs(2);

/// Minimum spacing between detection journal lines.
const DETECTION_LOG_INTERVAL: Duration = Duration::from_secs(3);

/// Engine-facing ingestion callback.
///
/// `on_frame` runs on whatever worker the external engine calls from, so it
/// stays fast-path only: brightness and threat bookkeeping, the latest-frame
/// swap, and cheap counter updates. Anything heavy (sink writes, pipeline
/// switches) is handed to other workers through flags and channels.
pub struct FrameIngest {
    min_confidence: f32,
    latest: LatestFrame,
    blackout: Mutex<BlackoutDetector>,
    threat: Mutex<ThreatWindow>,
    frame_times: Mutex<VecDeque<Instant>>,
    snapshot: Arc<RwLock<HealthSnapshot>>,
    journal: Arc<Journal>,
    alerts: Arc<AlertBook>,
    recorder: Arc<Recorder>,
    switch_tx: mpsc::Sender<SwitchReason>,
    last_detection_log: Mutex<Option<Instant>>,
}

impl FrameIngest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blackout_config: &BlackoutConfig,
        threat_config: &ThreatConfig,
        latest: LatestFrame,
        snapshot: Arc<RwLock<HealthSnapshot>>,
        journal: Arc<Journal>,
        alerts: Arc<AlertBook>,
        recorder: Arc<Recorder>,
        switch_tx: mpsc::Sender<SwitchReason>,
    ) -> Self {
        Self {
            min_confidence: threat_config.min_confidence,
            latest,
            blackout: Mutex::new(BlackoutDetector::new(blackout_config)),
            threat: Mutex::new(ThreatWindow::new(threat_config)),
            frame_times: Mutex::new(VecDeque::new()),
            snapshot,
            journal,
            alerts,
            recorder,
            switch_tx,
            last_detection_log: Mutex::new(None),
        }
    }

    /// One frame plus its detections, as delivered by the engine.
    pub fn on_frame(&self, frame: VideoFrame, predictions: &[Prediction]) {
        let now = Instant::now();

        self.update_fps(now);
        self.observe_brightness(&frame, now);

        let filtered: Vec<Prediction> = predictions
            .iter()
            .filter(|p| p.confidence > self.min_confidence)
            .cloned()
            .collect();

        if !filtered.is_empty() {
            self.log_detections(&filtered, now);
        }

        let report = {
            let mut threat = self.threat.lock();
            threat.observe(&filtered, self.recorder.is_active(), now)
        };

        if let Some(report) = report {
            let summary = format!(
                "Threat detected: {} (avg confidence {:.2})",
                report.labels.join(", "),
                report.avg_confidence
            );
            self.journal.record("THREAT", &summary);
            self.alerts.raise(
                AlertSeverity::Critical,
                summary,
                report.labels.clone(),
                Some(report.avg_confidence),
            );

            if report.trigger {
                self.recorder.start("threat threshold reached");
            }
        }

        self.latest.store(frame);
    }

    /// The failover controller calls this when the active feed changes:
    /// blackout episodes and the displayed frame belong to the old feed.
    pub fn reset_feed_state(&self) {
        self.blackout.lock().reset();
        self.latest.clear();
        self.frame_times.lock().clear();
    }

    pub fn latest(&self) -> &LatestFrame {
        &self.latest
    }

    fn update_fps(&self, now: Instant) {
        let mut times = self.frame_times.lock();
        times.push_back(now);
        while times
            .front()
            .is_some_and(|t| now.duration_since(*t) > FPS_WINDOW)
        {
            times.pop_front();
        }

        let fps = if times.len() >= 2 {
            let span = now.duration_since(times[0]).as_secs_f64();
            if span > 0.0 {
                (times.len() - 1) as f64 / span
            } else {
                0.0
            }
        } else {
            0.0
        };
        drop(times);

        self.snapshot.write().fps = fps;
    }

    fn observe_brightness(&self, frame: &VideoFrame, now: Instant) {
        let fired = self.blackout.lock().observe(frame.mean_luminance(), now);
        if !fired {
            return;
        }

        self.journal
            .record("BLACKOUT", "Sustained blackout on active feed");
        self.alerts.raise(
            AlertSeverity::Warning,
            "Sustained blackout on active feed, requesting failover",
            Vec::new(),
            None,
        );
        // Non-blocking: a full queue means a switch is already pending.
        if let Err(e) = self.switch_tx.try_send(SwitchReason::Blackout) {
            warn!("Failover request dropped: {}", e);
        }
    }

    fn log_detections(&self, filtered: &[Prediction], now: Instant) {
        let mut last = self.last_detection_log.lock();
        let due = last.map_or(true, |at| now.duration_since(at) >= DETECTION_LOG_INTERVAL);
        if !due {
            return;
        }
        *last = Some(now);
        drop(last);

        let labels: Vec<&str> = filtered.iter().map(|p| p.label.as_str()).collect();
        debug!("Detections: {}", labels.join(", "));
        self.journal
            .record("DETECTION", format!("Detections: {}", labels.join(", ")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordingConfig;
    use crate::frame::BoundingBox;
    use crate::recording::MjpegSinkFactory;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn frame(id: u64, brightness: u8) -> VideoFrame {
        VideoFrame::new(
            id,
            SystemTime::now(),
            2,
            2,
            vec![brightness; 4],
            vec![0xFF, 0xD8, 0xFF, 0xD9],
        )
    }

    fn prediction(label: &str, confidence: f32) -> Prediction {
        Prediction {
            label: label.to_string(),
            confidence,
            bbox: BoundingBox::default(),
        }
    }

    struct Harness {
        ingest: FrameIngest,
        recorder: Arc<Recorder>,
        alerts: Arc<AlertBook>,
        switch_rx: mpsc::Receiver<SwitchReason>,
        _dir: tempfile::TempDir,
    }

    fn harness(blackout_sustain_secs: f64) -> Harness {
        let dir = tempdir().unwrap();
        let journal = Arc::new(Journal::default());
        let alerts = Arc::new(AlertBook::default());
        let latest = LatestFrame::new();
        let recorder = Arc::new(
            Recorder::new(
                RecordingConfig {
                    path: dir.path().to_string_lossy().to_string(),
                    duration_secs: 60,
                    fps: 50.0,
                },
                latest.clone(),
                Arc::new(MjpegSinkFactory),
                Arc::clone(&journal),
            )
            .unwrap(),
        );
        let (switch_tx, switch_rx) = mpsc::channel(4);

        let ingest = FrameIngest::new(
            &BlackoutConfig {
                dark_threshold: 10.0,
                sustain_secs: blackout_sustain_secs,
            },
            &ThreatConfig {
                min_confidence: 0.55,
                cooldown_secs: 0.0,
                window_secs: 10.0,
                trigger_threshold: 2,
            },
            latest,
            Arc::new(RwLock::new(HealthSnapshot::default())),
            journal,
            Arc::clone(&alerts),
            Arc::clone(&recorder),
            switch_tx,
        );

        Harness {
            ingest,
            recorder,
            alerts,
            switch_rx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_threat_threshold_starts_recording_and_alerts() {
        let h = harness(5.0);

        h.ingest.on_frame(frame(1, 128), &[prediction("knife", 0.9)]);
        assert!(!h.recorder.is_active());

        h.ingest.on_frame(frame(2, 128), &[prediction("gun", 0.8)]);
        assert!(h.recorder.is_active());

        let alerts = h.alerts.list();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);

        h.recorder.stop();
    }

    #[tokio::test]
    async fn test_low_confidence_predictions_are_ignored() {
        let h = harness(5.0);
        h.ingest.on_frame(frame(1, 128), &[prediction("knife", 0.4)]);
        h.ingest.on_frame(frame(2, 128), &[prediction("gun", 0.55)]);
        assert!(!h.recorder.is_active());
        assert!(h.alerts.list().is_empty());
    }

    #[tokio::test]
    async fn test_sustained_blackout_requests_switch() {
        let mut h = harness(0.0);

        h.ingest.on_frame(frame(1, 2), &[]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.ingest.on_frame(frame(2, 2), &[]);

        assert_eq!(h.switch_rx.try_recv().ok(), Some(SwitchReason::Blackout));
        // Fires once per episode: further dark frames queue nothing.
        h.ingest.on_frame(frame(3, 2), &[]);
        assert!(h.switch_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_latest_frame_is_published_and_reset() {
        let h = harness(5.0);
        h.ingest.on_frame(frame(7, 128), &[]);
        assert_eq!(h.ingest.latest().snapshot().unwrap().id, 7);

        h.ingest.reset_feed_state();
        assert!(h.ingest.latest().snapshot().is_none());
    }
}
