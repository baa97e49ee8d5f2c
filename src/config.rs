use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FailcamConfig {
    pub camera: CameraConfig,
    pub probe: ProbeConfig,
    pub health: HealthConfig,
    pub blackout: BlackoutConfig,
    pub threat: ThreatConfig,
    pub recording: RecordingConfig,
    pub watch: WatchConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Primary camera host (IP or hostname)
    #[serde(default = "default_primary_host")]
    pub primary_host: String,

    /// Primary camera port
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,

    /// Display name for the primary camera
    #[serde(default = "default_primary_name")]
    pub primary_name: String,

    /// Optional credentials for the primary camera
    pub primary_username: Option<String>,
    pub primary_password: Option<String>,

    /// Path to the persisted backup endpoint store
    #[serde(default = "default_endpoints_file")]
    pub endpoints_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeConfig {
    /// Number of TCP connection attempts per reachability check
    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,

    /// Per-attempt connect timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: f64,

    /// Backoff between attempts in seconds
    #[serde(default = "default_probe_backoff_secs")]
    pub backoff_secs: f64,

    /// Alternate port tried on the second attempt when the original port is 80.
    /// Consumer IP-camera apps commonly serve there instead.
    #[serde(default = "default_alternate_port")]
    pub alternate_port: u16,

    /// Frame-liveness probe timeout in seconds
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HealthConfig {
    /// Sampler loop interval in seconds
    #[serde(default = "default_health_poll_secs")]
    pub poll_secs: f64,

    /// Connection attempts per sampling batch
    #[serde(default = "default_sample_attempts")]
    pub sample_attempts: u32,

    /// Per-attempt timeout in seconds for sampling connections
    #[serde(default = "default_sample_timeout_secs")]
    pub sample_timeout_secs: f64,

    /// Spacing between sampling attempts in seconds
    #[serde(default = "default_sample_spacing_secs")]
    pub sample_spacing_secs: f64,

    /// GOOD grade bounds
    #[serde(default = "default_good_latency_ms")]
    pub good_latency_ms: f64,
    #[serde(default = "default_good_jitter_ms")]
    pub good_jitter_ms: f64,
    #[serde(default = "default_good_loss_pct")]
    pub good_loss_pct: f64,

    /// FAIR grade bounds
    #[serde(default = "default_fair_latency_ms")]
    pub fair_latency_ms: f64,
    #[serde(default = "default_fair_jitter_ms")]
    pub fair_jitter_ms: f64,
    #[serde(default = "default_fair_loss_pct")]
    pub fair_loss_pct: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BlackoutConfig {
    /// Mean luminance below this value counts as a dark frame (0..=255 scale)
    #[serde(default = "default_dark_threshold")]
    pub dark_threshold: f64,

    /// Darkness must persist this long before a failover fires, in seconds
    #[serde(default = "default_blackout_sustain_secs")]
    pub sustain_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ThreatConfig {
    /// Minimum confidence for a prediction to be considered at all
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Minimum spacing before the same threat label is counted again, seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,

    /// Sliding window over which counted events are evaluated, seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,

    /// Counted events within the window needed to trigger a recording
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    /// Directory recordings are written to
    #[serde(default = "default_recordings_path")]
    pub path: String,

    /// Fixed recording duration in seconds
    #[serde(default = "default_recording_duration_secs")]
    pub duration_secs: u64,

    /// Target write rate in frames per second
    #[serde(default = "default_recording_fps")]
    pub fps: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Failover watch loop interval in seconds
    #[serde(default = "default_watch_interval_secs")]
    pub interval_secs: f64,

    /// Settle delay after signaling pipeline teardown, seconds
    #[serde(default = "default_settle_secs")]
    pub settle_secs: f64,

    /// Heartbeat period for the otherwise transition-only logging, seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    /// IP address to bind to
    #[serde(default = "default_api_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl FailcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("failcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.primary_host", default_primary_host())?
            .set_default("camera.primary_port", default_primary_port() as i64)?
            .set_default("camera.primary_name", default_primary_name())?
            .set_default("camera.endpoints_file", default_endpoints_file())?
            .set_default("probe.attempts", default_probe_attempts() as i64)?
            .set_default("probe.timeout_secs", default_probe_timeout_secs())?
            .set_default("probe.backoff_secs", default_probe_backoff_secs())?
            .set_default("probe.alternate_port", default_alternate_port() as i64)?
            .set_default(
                "probe.liveness_timeout_secs",
                default_liveness_timeout_secs(),
            )?
            .set_default("health.poll_secs", default_health_poll_secs())?
            .set_default("health.sample_attempts", default_sample_attempts() as i64)?
            .set_default("health.sample_timeout_secs", default_sample_timeout_secs())?
            .set_default("health.sample_spacing_secs", default_sample_spacing_secs())?
            .set_default("health.good_latency_ms", default_good_latency_ms())?
            .set_default("health.good_jitter_ms", default_good_jitter_ms())?
            .set_default("health.good_loss_pct", default_good_loss_pct())?
            .set_default("health.fair_latency_ms", default_fair_latency_ms())?
            .set_default("health.fair_jitter_ms", default_fair_jitter_ms())?
            .set_default("health.fair_loss_pct", default_fair_loss_pct())?
            .set_default("blackout.dark_threshold", default_dark_threshold())?
            .set_default("blackout.sustain_secs", default_blackout_sustain_secs())?
            .set_default("threat.min_confidence", default_min_confidence() as f64)?
            .set_default("threat.cooldown_secs", default_cooldown_secs())?
            .set_default("threat.window_secs", default_window_secs())?
            .set_default("threat.trigger_threshold", default_trigger_threshold() as i64)?
            .set_default("recording.path", default_recordings_path())?
            .set_default(
                "recording.duration_secs",
                default_recording_duration_secs() as i64,
            )?
            .set_default("recording.fps", default_recording_fps())?
            .set_default("watch.interval_secs", default_watch_interval_secs())?
            .set_default("watch.settle_secs", default_settle_secs())?
            .set_default("watch.heartbeat_secs", default_heartbeat_secs())?
            .set_default("api.ip", default_api_ip())?
            .set_default("api.port", default_api_port() as i64)?
            .add_source(File::with_name(&path_str).required(false))
            // Double-underscore section separator keeps multi-word field
            // names intact: FAILCAM_PROBE__TIMEOUT_SECS -> probe.timeout_secs.
            .add_source(
                Environment::with_prefix("FAILCAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: FailcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.primary_host.is_empty() {
            return Err(ConfigError::Message(
                "Primary camera host must not be empty".to_string(),
            ));
        }

        if self.camera.primary_port == 0 {
            return Err(ConfigError::Message(
                "Primary camera port must be greater than 0".to_string(),
            ));
        }

        if self.probe.attempts == 0 {
            return Err(ConfigError::Message(
                "Probe attempts must be greater than 0".to_string(),
            ));
        }

        if self.probe.timeout_secs <= 0.0 {
            return Err(ConfigError::Message(
                "Probe timeout must be greater than 0".to_string(),
            ));
        }

        if self.health.sample_attempts == 0 {
            return Err(ConfigError::Message(
                "Health sample attempts must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=255.0).contains(&self.blackout.dark_threshold) {
            return Err(ConfigError::Message(
                "Blackout dark threshold must be within 0..=255".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.threat.min_confidence) {
            return Err(ConfigError::Message(
                "Threat minimum confidence must be within 0..=1".to_string(),
            ));
        }

        if self.threat.trigger_threshold == 0 {
            return Err(ConfigError::Message(
                "Threat trigger threshold must be greater than 0".to_string(),
            ));
        }

        if self.threat.window_secs <= 0.0 {
            return Err(ConfigError::Message(
                "Threat window must be greater than 0".to_string(),
            ));
        }

        if self.recording.duration_secs == 0 {
            return Err(ConfigError::Message(
                "Recording duration must be greater than 0".to_string(),
            ));
        }

        if self.recording.fps <= 0.0 {
            return Err(ConfigError::Message(
                "Recording fps must be greater than 0".to_string(),
            ));
        }

        if self.watch.interval_secs <= 0.0 {
            return Err(ConfigError::Message(
                "Watch interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl RecordingConfig {
    /// Fixed sleep between sink writes derived from the target fps.
    pub fn write_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

impl Default for FailcamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                primary_host: default_primary_host(),
                primary_port: default_primary_port(),
                primary_name: default_primary_name(),
                primary_username: None,
                primary_password: None,
                endpoints_file: default_endpoints_file(),
            },
            probe: ProbeConfig {
                attempts: default_probe_attempts(),
                timeout_secs: default_probe_timeout_secs(),
                backoff_secs: default_probe_backoff_secs(),
                alternate_port: default_alternate_port(),
                liveness_timeout_secs: default_liveness_timeout_secs(),
            },
            health: HealthConfig {
                poll_secs: default_health_poll_secs(),
                sample_attempts: default_sample_attempts(),
                sample_timeout_secs: default_sample_timeout_secs(),
                sample_spacing_secs: default_sample_spacing_secs(),
                good_latency_ms: default_good_latency_ms(),
                good_jitter_ms: default_good_jitter_ms(),
                good_loss_pct: default_good_loss_pct(),
                fair_latency_ms: default_fair_latency_ms(),
                fair_jitter_ms: default_fair_jitter_ms(),
                fair_loss_pct: default_fair_loss_pct(),
            },
            blackout: BlackoutConfig {
                dark_threshold: default_dark_threshold(),
                sustain_secs: default_blackout_sustain_secs(),
            },
            threat: ThreatConfig {
                min_confidence: default_min_confidence(),
                cooldown_secs: default_cooldown_secs(),
                window_secs: default_window_secs(),
                trigger_threshold: default_trigger_threshold(),
            },
            recording: RecordingConfig {
                path: default_recordings_path(),
                duration_secs: default_recording_duration_secs(),
                fps: default_recording_fps(),
            },
            watch: WatchConfig {
                interval_secs: default_watch_interval_secs(),
                settle_secs: default_settle_secs(),
                heartbeat_secs: default_heartbeat_secs(),
            },
            api: ApiConfig {
                ip: default_api_ip(),
                port: default_api_port(),
            },
        }
    }
}

// Default value functions
fn default_primary_host() -> String {
    "192.168.1.100".to_string()
}
fn default_primary_port() -> u16 {
    8080
}
fn default_primary_name() -> String {
    "Primary Camera".to_string()
}
fn default_endpoints_file() -> String {
    "backup_cameras.json".to_string()
}

fn default_probe_attempts() -> u32 {
    2
}
fn default_probe_timeout_secs() -> f64 {
    2.0
}
fn default_probe_backoff_secs() -> f64 {
    0.3
}
fn default_alternate_port() -> u16 {
    8080
}
fn default_liveness_timeout_secs() -> f64 {
    5.0
}

fn default_health_poll_secs() -> f64 {
    5.0
}
fn default_sample_attempts() -> u32 {
    6
}
fn default_sample_timeout_secs() -> f64 {
    1.5
}
fn default_sample_spacing_secs() -> f64 {
    0.1
}
fn default_good_latency_ms() -> f64 {
    80.0
}
fn default_good_jitter_ms() -> f64 {
    20.0
}
fn default_good_loss_pct() -> f64 {
    2.0
}
fn default_fair_latency_ms() -> f64 {
    200.0
}
fn default_fair_jitter_ms() -> f64 {
    50.0
}
fn default_fair_loss_pct() -> f64 {
    8.0
}

fn default_dark_threshold() -> f64 {
    10.0
}
fn default_blackout_sustain_secs() -> f64 {
    5.0
}

fn default_min_confidence() -> f32 {
    0.55
}
fn default_cooldown_secs() -> f64 {
    3.0
}
fn default_window_secs() -> f64 {
    10.0
}
fn default_trigger_threshold() -> usize {
    2
}

fn default_recordings_path() -> String {
    "./recordings".to_string()
}
fn default_recording_duration_secs() -> u64 {
    60
}
fn default_recording_fps() -> f64 {
    20.0
}

fn default_watch_interval_secs() -> f64 {
    5.0
}
fn default_settle_secs() -> f64 {
    1.0
}
fn default_heartbeat_secs() -> f64 {
    60.0
}

fn default_api_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FailcamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe.attempts, 2);
        assert_eq!(config.threat.trigger_threshold, 2);
        assert_eq!(config.recording.duration_secs, 60);
    }

    #[test]
    fn test_config_validation_rejects_out_of_range() {
        let mut config = FailcamConfig::default();
        config.threat.min_confidence = 1.5;
        assert!(config.validate().is_err());

        config.threat.min_confidence = 0.55;
        config.blackout.dark_threshold = 300.0;
        assert!(config.validate().is_err());

        config.blackout.dark_threshold = 10.0;
        config.recording.duration_secs = 0;
        assert!(config.validate().is_err());

        config.recording.duration_secs = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override_reaches_nested_keys() {
        std::env::set_var("FAILCAM_PROBE__TIMEOUT_SECS", "0.75");
        std::env::set_var("FAILCAM_CAMERA__PRIMARY_HOST", "10.1.2.3");

        let config = FailcamConfig::load_from_file("does_not_exist.toml").unwrap();

        std::env::remove_var("FAILCAM_PROBE__TIMEOUT_SECS");
        std::env::remove_var("FAILCAM_CAMERA__PRIMARY_HOST");

        assert_eq!(config.probe.timeout_secs, 0.75);
        assert_eq!(config.camera.primary_host, "10.1.2.3");
        // Untouched keys keep their defaults.
        assert_eq!(config.probe.attempts, 2);
    }

    #[test]
    fn test_write_interval_from_fps() {
        let config = RecordingConfig {
            path: "./recordings".to_string(),
            duration_secs: 60,
            fps: 20.0,
        };
        assert_eq!(config.write_interval(), Duration::from_millis(50));
    }
}
