use crate::config::ProbeConfig;
use crate::error::{FailcamError, Result};
use crate::ingest::FrameIngest;
use crate::probe::{parse_host_port, Prober, TcpProber};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a running capture/detection pipeline for one feed URL.
///
/// Capture, decoding and object detection are external; this is the
/// engine-agnostic seam the failover controller drives. `shutdown` is the
/// single mandatory teardown: adapters fold whatever graceful-stop, close or
/// release sequence their engine needs into it, and it must be safe to call
/// on a pipeline that already died.
#[async_trait]
pub trait FeedPipeline: Send + Sync {
    fn url(&self) -> &str;

    async fn start(&mut self) -> Result<()>;

    async fn shutdown(&mut self);
}

/// Produces pipelines and answers frame-liveness probes.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    /// Whether the feed at `url` is actually producing frames, within
    /// `timeout`. Distinct from TCP reachability: a camera can accept
    /// connections while serving a stalled stream.
    async fn probe_live(&self, url: &str, timeout: Duration) -> bool;

    /// Build a pipeline for `url` wired to the ingestion callback.
    async fn connect(&self, url: &str, ingest: Arc<FrameIngest>) -> Result<Box<dyn FeedPipeline>>;
}

/// Factory for deployments where the engine pushes frames into
/// [`FrameIngest`] from outside the process. Liveness is approximated by TCP
/// reachability and the pipeline handle only tracks identity and lifecycle.
pub struct ProbeOnlyFactory {
    prober: Arc<dyn Prober>,
}

impl ProbeOnlyFactory {
    pub fn new() -> Self {
        Self {
            prober: Arc::new(TcpProber),
        }
    }
}

impl Default for ProbeOnlyFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineFactory for ProbeOnlyFactory {
    async fn probe_live(&self, url: &str, timeout: Duration) -> bool {
        let Some((host, port)) = parse_host_port(url) else {
            return false;
        };
        match self.prober.connect(&host, port, timeout).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Liveness probe failed for {}:{}: {}", host, port, e);
                false
            }
        }
    }

    async fn connect(&self, url: &str, _ingest: Arc<FrameIngest>) -> Result<Box<dyn FeedPipeline>> {
        if parse_host_port(url).is_none() {
            return Err(FailcamError::pipeline("unparseable feed URL"));
        }
        Ok(Box::new(PassivePipeline {
            url: url.to_string(),
            running: false,
        }))
    }
}

/// Pipeline handle that owns no capture loop of its own.
struct PassivePipeline {
    url: String,
    running: bool,
}

#[async_trait]
impl FeedPipeline for PassivePipeline {
    fn url(&self) -> &str {
        &self.url
    }

    async fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.running {
            self.running = false;
        } else {
            warn!("Shutdown of pipeline that never started: {}", self.url);
        }
    }
}

/// Default timeout for a frame-liveness probe.
pub fn liveness_timeout(config: &ProbeConfig) -> Duration {
    Duration::from_secs_f64(config.liveness_timeout_secs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted factory: liveness answered per URL, connects recorded,
    /// shutdowns counted across all pipelines it produced.
    pub(crate) struct MockFactory {
        live: Mutex<HashMap<String, bool>>,
        pub connected: Mutex<Vec<String>>,
        pub shutdowns: Arc<AtomicUsize>,
    }

    impl MockFactory {
        pub fn new() -> Self {
            Self {
                live: Mutex::new(HashMap::new()),
                connected: Mutex::new(Vec::new()),
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn set_live(&self, url: &str, live: bool) {
            self.live.lock().insert(url.to_string(), live);
        }
    }

    #[async_trait]
    impl PipelineFactory for MockFactory {
        async fn probe_live(&self, url: &str, _timeout: Duration) -> bool {
            self.live.lock().get(url).copied().unwrap_or(false)
        }

        async fn connect(
            &self,
            url: &str,
            _ingest: Arc<FrameIngest>,
        ) -> Result<Box<dyn FeedPipeline>> {
            self.connected.lock().push(url.to_string());
            Ok(Box::new(MockPipeline {
                url: url.to_string(),
                shutdowns: Arc::clone(&self.shutdowns),
            }))
        }
    }

    struct MockPipeline {
        url: String,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedPipeline for MockPipeline {
        fn url(&self) -> &str {
            &self.url
        }

        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_probe_only_factory_rejects_bad_url() {
        let factory = ProbeOnlyFactory::new();
        assert!(!factory.probe_live("not a url", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_passive_pipeline_lifecycle() {
        let mut pipeline = PassivePipeline {
            url: "http://10.0.0.1/video".to_string(),
            running: false,
        };
        pipeline.start().await.unwrap();
        assert_eq!(pipeline.url(), "http://10.0.0.1/video");
        pipeline.shutdown().await;
        assert!(!pipeline.running);
    }
}
