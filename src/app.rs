use crate::api::{self, ApiState};
use crate::chain::{ActiveFeed, CameraChain, CameraEndpoint, FeedLabel};
use crate::config::FailcamConfig;
use crate::error::{FailcamError, Result};
use crate::failover::{FailoverController, SwitchReason};
use crate::frame::LatestFrame;
use crate::ingest::FrameIngest;
use crate::journal::{AlertBook, Journal};
use crate::pipeline::{PipelineFactory, ProbeOnlyFactory};
use crate::probe::{HealthMonitor, HealthSnapshot, Prober, TcpProber};
use crate::recording::{MjpegSinkFactory, Recorder, SinkFactory};
use crate::store::EndpointStore;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wires configuration, state and workers together and owns their lifecycle.
pub struct FailcamApp {
    config: FailcamConfig,
    shutdown: CancellationToken,
    state: ApiState,
    controller: Arc<FailoverController>,
    monitor: Arc<HealthMonitor>,
    ingest: Arc<FrameIngest>,
    switch_rx: Option<mpsc::Receiver<SwitchReason>>,
    tasks: Vec<JoinHandle<()>>,
}

impl FailcamApp {
    /// Build the full component graph with production collaborators.
    pub fn new(config: FailcamConfig) -> Result<Self> {
        Self::with_collaborators(
            config,
            Arc::new(TcpProber),
            Arc::new(ProbeOnlyFactory::new()),
            Arc::new(MjpegSinkFactory),
        )
    }

    /// Same graph with the external seams injected. Engine integrations use
    /// this to supply their own pipeline factory and encoder.
    pub fn with_collaborators(
        config: FailcamConfig,
        prober: Arc<dyn Prober>,
        factory: Arc<dyn PipelineFactory>,
        sink_factory: Arc<dyn SinkFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let store = EndpointStore::new(&config.camera.endpoints_file);
        let backups = store.load()?;

        let primary = CameraEndpoint::new(
            "primary",
            config.camera.primary_name.clone(),
            config.camera.primary_host.clone(),
            config.camera.primary_port,
            config.camera.primary_username.clone(),
            config.camera.primary_password.clone(),
        )?;
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

        let recorder = Arc::new(Recorder::new(
            config.recording.clone(),
            latest.clone(),
            sink_factory,
            Arc::clone(&journal),
        )?);

        let (switch_tx, switch_rx) = mpsc::channel(8);
        let ingest = Arc::new(FrameIngest::new(
            &config.blackout,
            &config.threat,
            latest.clone(),
            Arc::clone(&snapshot),
            Arc::clone(&journal),
            Arc::clone(&alerts),
            Arc::clone(&recorder),
            switch_tx,
        ));

        let controller = Arc::new(FailoverController::new(
            config.probe.clone(),
            config.watch.clone(),
            Arc::clone(&prober),
            Arc::clone(&factory),
            Arc::clone(&ingest),
            Arc::clone(&chain),
            Arc::clone(&active),
            Arc::clone(&journal),
            Arc::clone(&alerts),
        ));

        let monitor = Arc::new(HealthMonitor::new(
            config.health.clone(),
            prober,
            Arc::clone(&active),
            Arc::clone(&snapshot),
        ));

        let state = ApiState {
            controller: Arc::clone(&controller),
            recorder,
            journal,
            alerts,
            chain,
            store,
            snapshot,
            active,
            latest,
            factory,
            probe_config: config.probe.clone(),
        };

        Ok(Self {
            config,
            shutdown: CancellationToken::new(),
            state,
            controller,
            monitor,
            ingest,
            switch_rx: Some(switch_rx),
            tasks: Vec::new(),
        })
    }

    /// Ingestion handle for the external detection engine.
    pub fn ingest(&self) -> Arc<FrameIngest> {
        Arc::clone(&self.ingest)
    }

    /// Spawn the background workers and the API server.
    pub async fn start(&mut self) -> Result<()> {
        let switch_rx = self
            .switch_rx
            .take()
            .ok_or_else(|| FailcamError::system("application already started"))?;

        // A dead primary at boot is not fatal: the watch loop keeps walking
        // the chain until something answers.
        if let Err(e) = self.controller.start().await {
            warn!("Initial feed is unavailable, failover will retry: {}", e);
        }

        let controller = Arc::clone(&self.controller);
        let token = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            controller.run(token, switch_rx).await;
        }));

        let monitor = Arc::clone(&self.monitor);
        let token = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            monitor.run(token).await;
        }));

        let api_config = self.config.api.clone();
        let api_state = self.state.clone();
        let token = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(&api_config, api_state, token).await {
                error!("API server terminated: {}", e);
            }
        }));

        info!("All components started");
        Ok(())
    }

    /// Block until a shutdown signal arrives, then quiesce everything.
    pub async fn run(&mut self) -> Result<i32> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupt received, shutting down"),
                    Err(e) => error!("Signal handler failed: {}", e),
                }
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested internally");
            }
        }

        self.stop().await;
        Ok(0)
    }

    /// Cancel the global token and wait for the workers to drain.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        self.state.recorder.stop();

        for result in futures::future::join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                error!("Worker task panicked during shutdown: {}", e);
            }
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> FailcamConfig {
        let mut config = FailcamConfig::default();
        config.camera.endpoints_file = dir
            .join("backup_cameras.json")
            .to_string_lossy()
            .to_string();
        config.recording.path = dir.join("recordings").to_string_lossy().to_string();
        // Ephemeral port so tests can run in parallel.
        config.api.ip = "127.0.0.1".to_string();
        config.api.port = 0;
        config.watch.interval_secs = 0.05;
        config.watch.settle_secs = 0.0;
        config.probe.timeout_secs = 0.05;
        config.probe.liveness_timeout_secs = 0.05;
        config.health.poll_secs = 0.05;
        config.health.sample_timeout_secs = 0.05;
        config.health.sample_spacing_secs = 0.0;
        config
    }

    #[tokio::test]
    async fn test_app_starts_and_stops_cleanly() {
        let dir = tempdir().unwrap();
        let mut app = FailcamApp::new(test_config(dir.path())).unwrap();

        app.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        app.shutdown.cancel();
        app.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = tempdir().unwrap();
        let mut app = FailcamApp::new(test_config(dir.path())).unwrap();
        app.start().await.unwrap();
        assert!(app.start().await.is_err());
        app.stop().await;
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.recording.fps = 0.0;
        assert!(FailcamApp::new(config).is_err());
    }
}
