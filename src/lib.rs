pub mod api;
pub mod app;
pub mod blackout;
pub mod chain;
pub mod config;
pub mod error;
pub mod failover;
pub mod frame;
pub mod ingest;
pub mod journal;
pub mod pipeline;
pub mod probe;
pub mod recording;
pub mod store;
pub mod threat;

pub use app::FailcamApp;
pub use chain::{ActiveFeed, CameraChain, CameraEndpoint, FeedLabel};
pub use config::FailcamConfig;
pub use error::{FailcamError, Result};
pub use failover::{FailoverController, FeedState, SwitchReason};
pub use frame::{BoundingBox, LatestFrame, Prediction, VideoFrame};
pub use ingest::FrameIngest;
pub use journal::{Alert, AlertBook, AlertSeverity, Journal};
pub use pipeline::{FeedPipeline, PipelineFactory};
pub use probe::{HealthGrade, HealthMonitor, HealthSnapshot, Prober, TcpProber};
pub use recording::{Recorder, RecordingStatus, SinkFactory, VideoSink};
pub use store::EndpointStore;
pub use threat::{ThreatWindow, THREAT_VOCABULARY};
