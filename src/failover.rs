use crate::chain::{ActiveFeed, CameraChain};
use crate::config::{ProbeConfig, WatchConfig};
use crate::error::{FailcamError, Result};
use crate::ingest::FrameIngest;
use crate::journal::{AlertBook, AlertSeverity, Journal};
use crate::pipeline::{liveness_timeout, FeedPipeline, PipelineFactory};
use crate::probe::{probe_attempts, Prober};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a feed switch was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// TCP reachability probe failed
    Unreachable,
    /// Reachable but no frames are arriving
    FrameStall,
    /// Sustained dark picture on the active feed
    Blackout,
}

impl SwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchReason::Unreachable => "unreachable",
            SwitchReason::FrameStall => "frame stall",
            SwitchReason::Blackout => "blackout",
        }
    }
}

/// Health of the current pipeline attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedState {
    Alive,
    Failed,
    Recovering,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Alive => "ALIVE",
            FeedState::Failed => "FAILED",
            FeedState::Recovering => "RECOVERING",
        }
    }
}

/// Last observed values for the transition-only watch logging.
struct TransitionTrackers {
    tcp: Option<bool>,
    live: Option<bool>,
    overall: Option<bool>,
    last_heartbeat: Instant,
}

impl TransitionTrackers {
    fn new() -> Self {
        Self {
            tcp: None,
            live: None,
            overall: None,
            last_heartbeat: Instant::now(),
        }
    }
}

/// Serialized feed-switching state machine.
///
/// All paths that tear down or start a pipeline (watch failures, blackout
/// requests, manual stream control, shutdown) funnel through `switch_lock`,
/// so at most one switch is in flight and the pipeline slot is handed over
/// exactly once.
pub struct FailoverController {
    probe_config: ProbeConfig,
    watch_config: WatchConfig,
    prober: Arc<dyn Prober>,
    factory: Arc<dyn PipelineFactory>,
    ingest: Arc<FrameIngest>,
    chain: Arc<RwLock<CameraChain>>,
    active: Arc<RwLock<ActiveFeed>>,
    state: Arc<RwLock<FeedState>>,
    journal: Arc<Journal>,
    alerts: Arc<AlertBook>,
    pipeline: AsyncMutex<Option<Box<dyn FeedPipeline>>>,
    switch_lock: AsyncMutex<()>,
    // Engine adapters poll this at ~1s to wind down their capture loop
    // before the hard teardown.
    stop_flag: Arc<AtomicBool>,
    running: AtomicBool,
    // Intent flag: true between start() and stop(). While supervised but not
    // running, the watch loop keeps advancing the chain instead of idling.
    supervised: AtomicBool,
    trackers: Mutex<TransitionTrackers>,
}

impl FailoverController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        probe_config: ProbeConfig,
        watch_config: WatchConfig,
        prober: Arc<dyn Prober>,
        factory: Arc<dyn PipelineFactory>,
        ingest: Arc<FrameIngest>,
        chain: Arc<RwLock<CameraChain>>,
        active: Arc<RwLock<ActiveFeed>>,
        journal: Arc<Journal>,
        alerts: Arc<AlertBook>,
    ) -> Self {
        Self {
            probe_config,
            watch_config,
            prober,
            factory,
            ingest,
            chain,
            active,
            state: Arc::new(RwLock::new(FeedState::Recovering)),
            journal,
            alerts,
            pipeline: AsyncMutex::new(None),
            switch_lock: AsyncMutex::new(()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            supervised: AtomicBool::new(false),
            trackers: Mutex::new(TransitionTrackers::new()),
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop signal for engine adapters driving their own capture loop.
    pub fn pipeline_stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Start a pipeline against the current active feed. No-op when one is
    /// already running.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.switch_lock.lock().await;
        self.supervised.store(true, Ordering::SeqCst);
        if self.is_running() {
            return Ok(());
        }
        self.start_pipeline_locked().await
    }

    /// Tear down the running pipeline, if any, and stop supervising.
    /// Idempotent.
    pub async fn stop(&self) {
        let _guard = self.switch_lock.lock().await;
        self.supervised.store(false, Ordering::SeqCst);
        self.teardown_locked().await;
    }

    /// Watch-and-switch loop. Returns when the token is cancelled, after
    /// tearing the pipeline down.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
        mut switch_rx: mpsc::Receiver<SwitchReason>,
    ) {
        let interval = Duration::from_secs_f64(self.watch_config.interval_secs);
        debug!("Failover watch loop started (interval {:?})", interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Failover controller shutting down");
                    self.stop().await;
                    break;
                }
                Some(reason) = switch_rx.recv() => {
                    if self.is_running() {
                        self.switch(reason).await;
                    }
                }
                _ = sleep(interval) => {
                    self.supervise_cycle().await;
                }
            }
        }
    }

    /// One tick of the watch loop: supervise a running pipeline, or keep
    /// trying the chain after a failed start.
    pub(crate) async fn supervise_cycle(&self) {
        if !self.supervised.load(Ordering::SeqCst) {
            return;
        }
        if self.is_running() {
            self.watch_cycle().await;
        } else {
            self.switch(SwitchReason::Unreachable).await;
        }
    }

    /// One supervision pass over the active feed.
    pub(crate) async fn watch_cycle(&self) {
        let feed = self.active.read().clone();
        if feed.url.is_empty() {
            return;
        }

        let (tcp_ok, attempts) =
            probe_attempts(self.prober.as_ref(), &feed.url, &self.probe_config).await;
        let live_ok = if tcp_ok {
            self.factory
                .probe_live(&feed.url, liveness_timeout(&self.probe_config))
                .await
        } else {
            false
        };
        let overall = tcp_ok && live_ok;

        self.log_transitions(&feed, tcp_ok, live_ok, overall);

        if !tcp_ok {
            debug!("Reachability attempts: {:?}", attempts);
            self.switch(SwitchReason::Unreachable).await;
        } else if !live_ok {
            self.switch(SwitchReason::FrameStall).await;
        }
    }

    fn log_transitions(&self, feed: &ActiveFeed, tcp_ok: bool, live_ok: bool, overall: bool) {
        let mut trackers = self.trackers.lock();

        if trackers.tcp != Some(tcp_ok) {
            trackers.tcp = Some(tcp_ok);
            self.journal.record(
                "WATCH",
                format!(
                    "TCP reachability of {} is now {}",
                    feed.name,
                    if tcp_ok { "up" } else { "down" }
                ),
            );
        }
        if trackers.live != Some(live_ok) {
            trackers.live = Some(live_ok);
            self.journal.record(
                "WATCH",
                format!(
                    "Frame liveness of {} is now {}",
                    feed.name,
                    if live_ok { "up" } else { "down" }
                ),
            );
        }
        if trackers.overall != Some(overall) {
            trackers.overall = Some(overall);
            self.journal.record(
                "WATCH",
                format!(
                    "Feed {} is {}",
                    feed.name,
                    if overall { "healthy" } else { "unhealthy" }
                ),
            );
        }

        if trackers.last_heartbeat.elapsed()
            >= Duration::from_secs_f64(self.watch_config.heartbeat_secs)
        {
            trackers.last_heartbeat = Instant::now();
            info!(
                "Watch heartbeat: {} ({}) {}",
                feed.name,
                feed.label,
                if overall { "healthy" } else { "unhealthy" }
            );
        }
    }

    /// Execute one serialized feed switch: tear the current pipeline down,
    /// advance the chain, and try to bring the next endpoint up.
    pub(crate) async fn switch(&self, reason: SwitchReason) {
        let _guard = self.switch_lock.lock().await;

        let failed = self.active.read().clone();
        warn!(
            "Switching away from {} ({}): {}",
            failed.name,
            failed.label,
            reason.as_str()
        );
        self.journal.record(
            "FAILOVER",
            format!("Leaving {} ({}): {}", failed.name, failed.label, reason.as_str()),
        );

        self.teardown_locked().await;

        let next = self.chain.read().resolve_next(&failed.url);
        {
            *self.active.write() = ActiveFeed::from(next.clone());
            *self.state.write() = FeedState::Recovering;
            *self.trackers.lock() = TransitionTrackers::new();
        }

        self.journal.record(
            "FAILOVER",
            format!("Switching to {} ({})", next.name, next.label),
        );
        self.alerts.raise(
            AlertSeverity::Warning,
            format!(
                "Feed failover: {} -> {} ({})",
                failed.name,
                next.name,
                reason.as_str()
            ),
            Vec::new(),
            None,
        );

        if let Err(e) = self.start_pipeline_locked().await {
            error!("Pipeline start against {} failed: {}", next.name, e);
        }
    }

    /// Caller must hold `switch_lock`.
    async fn teardown_locked(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        sleep(Duration::from_secs_f64(self.watch_config.settle_secs)).await;

        if let Some(mut pipeline) = self.pipeline.lock().await.take() {
            pipeline.shutdown().await;
        }
        self.running.store(false, Ordering::SeqCst);
        self.ingest.reset_feed_state();
    }

    /// Caller must hold `switch_lock`. Probes frame liveness before
    /// committing to a pipeline; on failure the attempt is abandoned and the
    /// watch loop will advance the chain on its next cycle.
    async fn start_pipeline_locked(&self) -> Result<()> {
        let feed = self.active.read().clone();
        if feed.url.is_empty() {
            return Err(FailcamError::pipeline("no active feed configured"));
        }

        let live = self
            .factory
            .probe_live(&feed.url, liveness_timeout(&self.probe_config))
            .await;
        if !live {
            *self.state.write() = FeedState::Failed;
            self.journal.record(
                "FAILOVER",
                format!("Endpoint {} is not serving frames, start aborted", feed.name),
            );
            return Err(FailcamError::pipeline(format!(
                "endpoint {} not live",
                feed.name
            )));
        }

        let mut pipeline = self
            .factory
            .connect(&feed.url, Arc::clone(&self.ingest))
            .await?;
        pipeline.start().await?;

        *self.pipeline.lock().await = Some(pipeline);
        self.stop_flag.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        *self.state.write() = FeedState::Alive;

        info!("Pipeline running against {} ({})", feed.name, feed.label);
        self.journal.record(
            "FAILOVER",
            format!("Feed {} ({}) is ALIVE", feed.name, feed.label),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{CameraEndpoint, FeedLabel};
    use crate::config::{BlackoutConfig, RecordingConfig, ThreatConfig};
    use crate::frame::LatestFrame;
    use crate::pipeline::tests::MockFactory;
    use crate::probe::tests::MockProber;
    use crate::probe::HealthSnapshot;
    use crate::recording::{MjpegSinkFactory, Recorder};
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    fn endpoint(id: &str, name: &str, host: &str) -> CameraEndpoint {
        CameraEndpoint::new(id, name, host, 8080, None, None).unwrap()
    }

    struct Harness {
        controller: FailoverController,
        prober: Arc<MockProber>,
        factory: Arc<MockFactory>,
        active: Arc<RwLock<ActiveFeed>>,
        journal: Arc<Journal>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let primary = endpoint("primary", "Front Door", "10.0.0.100");
        let backups = vec![
            endpoint("b1", "Garage", "10.0.0.1"),
            endpoint("b2", "Garden", "10.0.0.2"),
        ];
        let active = Arc::new(RwLock::new(ActiveFeed {
            url: primary.url(),
            label: FeedLabel::Primary,
            name: primary.name.clone(),
        }));
        let chain = Arc::new(RwLock::new(CameraChain::new(primary, backups)));

        let journal = Arc::new(Journal::default());
        let alerts = Arc::new(AlertBook::default());
        let latest = LatestFrame::new();
        let snapshot = Arc::new(RwLock::new(HealthSnapshot::default()));
        let recorder = Arc::new(
            Recorder::new(
                RecordingConfig {
                    path: dir.path().to_string_lossy().to_string(),
                    duration_secs: 60,
                    fps: 20.0,
                },
                latest.clone(),
                Arc::new(MjpegSinkFactory),
                Arc::clone(&journal),
            )
            .unwrap(),
        );
        let (switch_tx, _switch_rx) = mpsc::channel(4);
        let ingest = Arc::new(FrameIngest::new(
            &BlackoutConfig {
                dark_threshold: 10.0,
                sustain_secs: 5.0,
            },
            &ThreatConfig {
                min_confidence: 0.55,
                cooldown_secs: 3.0,
                window_secs: 10.0,
                trigger_threshold: 2,
            },
            latest,
            snapshot,
            Arc::clone(&journal),
            Arc::clone(&alerts),
            recorder,
            switch_tx,
        ));

        let prober = Arc::new(MockProber::new(false));
        let factory = Arc::new(MockFactory::new());

        let controller = FailoverController::new(
            ProbeConfig {
                attempts: 2,
                timeout_secs: 0.05,
                backoff_secs: 0.0,
                alternate_port: 8080,
                liveness_timeout_secs: 0.05,
            },
            WatchConfig {
                interval_secs: 0.05,
                settle_secs: 0.0,
                heartbeat_secs: 60.0,
            },
            Arc::clone(&prober) as Arc<dyn Prober>,
            Arc::clone(&factory) as Arc<dyn PipelineFactory>,
            ingest,
            chain,
            Arc::clone(&active),
            Arc::clone(&journal),
            alerts,
        );

        Harness {
            controller,
            prober,
            factory,
            active,
            journal,
            _dir: dir,
        }
    }

    fn script_reachable(prober: &MockProber, host: &str) {
        prober.script(
            host,
            8080,
            (0..32).map(|_| Ok(Duration::from_millis(10))).collect(),
        );
    }

    #[tokio::test]
    async fn test_dead_primary_fails_over_to_first_live_backup() {
        let h = harness();
        // Primary refuses TCP; backup 1 accepts TCP but serves no frames;
        // backup 2 is fully healthy.
        h.prober.refuse("10.0.0.100", 8080);
        script_reachable(&h.prober, "10.0.0.1");
        script_reachable(&h.prober, "10.0.0.2");
        h.factory.set_live("http://10.0.0.1:8080/video", false);
        h.factory.set_live("http://10.0.0.2:8080/video", true);

        // Primary serves no frames either, so the initial start fails and
        // the watch loop takes over chain traversal.
        assert!(h.controller.start().await.is_err());

        h.controller.supervise_cycle().await; // primary dead -> backup 1, not live
        assert_eq!(h.controller.state(), FeedState::Failed);
        assert_eq!(h.active.read().name, "Garage");

        h.controller.supervise_cycle().await; // backup 1 stalls -> backup 2, alive

        assert_eq!(h.controller.state(), FeedState::Alive);
        let active = h.active.read().clone();
        assert_eq!(active.label, FeedLabel::Backup);
        assert_eq!(active.name, "Garden");
        assert_eq!(
            h.factory.connected.lock().as_slice(),
            ["http://10.0.0.2:8080/video"]
        );

        // Healthy backup survives a supervision pass unchanged, and the
        // reachability probe actually hit it.
        h.controller.supervise_cycle().await;
        assert_eq!(h.active.read().name, "Garden");
        assert_eq!(h.controller.state(), FeedState::Alive);
        assert!(h
            .prober
            .attempts
            .lock()
            .iter()
            .any(|(host, port)| host == "10.0.0.2" && *port == 8080));
    }

    #[tokio::test]
    async fn test_blackout_switch_advances_chain() {
        let h = harness();
        script_reachable(&h.prober, "10.0.0.1");
        h.factory.set_live("http://10.0.0.1:8080/video", true);
        h.factory.set_live("http://10.0.0.100:8080/video", true);

        h.controller.start().await.unwrap();
        assert!(h.controller.is_running());

        h.controller.switch(SwitchReason::Blackout).await;

        assert_eq!(h.active.read().name, "Garage");
        assert_eq!(h.controller.state(), FeedState::Alive);
        // The primary's pipeline was shut down exactly once.
        assert_eq!(
            h.factory
                .shutdowns
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_tears_down() {
        let h = harness();
        h.factory.set_live("http://10.0.0.100:8080/video", true);

        h.controller.start().await.unwrap();
        h.controller.start().await.unwrap();
        assert_eq!(h.factory.connected.lock().len(), 1);

        h.controller.stop().await;
        assert!(!h.controller.is_running());
        h.controller.stop().await;
        assert_eq!(
            h.factory
                .shutdowns
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_healthy_feed_logs_transition_only_once() {
        let h = harness();
        script_reachable(&h.prober, "10.0.0.100");
        h.factory.set_live("http://10.0.0.100:8080/video", true);

        h.controller.start().await.unwrap();
        h.controller.watch_cycle().await;
        h.controller.watch_cycle().await;

        let watch_entries: Vec<_> = h
            .journal
            .since(DateTime::<Utc>::MIN_UTC)
            .into_iter()
            .filter(|e| e.tag == "WATCH" && e.message.contains("healthy"))
            .collect();
        assert_eq!(watch_entries.len(), 1);
    }

    #[tokio::test]
    async fn test_start_aborts_when_endpoint_not_live() {
        let h = harness();
        // TCP reachable, but no frames anywhere.
        script_reachable(&h.prober, "10.0.0.100");

        assert!(h.controller.start().await.is_err());
        assert!(!h.controller.is_running());
        assert_eq!(h.controller.state(), FeedState::Failed);
        assert!(h.factory.connected.lock().is_empty());
    }
}
