use crate::config::BlackoutConfig;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sustained-blackout detector for the currently active feed.
///
/// Fed one mean-luminance reading per decoded frame. A frame below the dark
/// threshold starts (or extends) a dark episode; once darkness has persisted
/// past the sustain duration the detector fires exactly once for that episode.
/// Any bright frame resets the episode immediately.
#[derive(Debug)]
pub struct BlackoutDetector {
    dark_threshold: f64,
    sustain: Duration,
    dark_frames: u32,
    onset: Option<Instant>,
    fired: bool,
}

impl BlackoutDetector {
    pub fn new(config: &BlackoutConfig) -> Self {
        Self {
            dark_threshold: config.dark_threshold,
            sustain: Duration::from_secs_f64(config.sustain_secs),
            dark_frames: 0,
            onset: None,
            fired: false,
        }
    }

    /// Observe one frame's mean luminance. Returns true when a sustained
    /// blackout is detected and a failover should be requested; true is
    /// returned at most once per dark episode.
    pub fn observe(&mut self, mean_luminance: f64, now: Instant) -> bool {
        if mean_luminance < self.dark_threshold {
            self.dark_frames += 1;
            let onset = *self.onset.get_or_insert(now);

            if !self.fired && now.duration_since(onset) > self.sustain {
                self.fired = true;
                warn!(
                    "Blackout sustained for {:?} ({} dark frames); requesting failover",
                    now.duration_since(onset),
                    self.dark_frames
                );
                return true;
            }
        } else {
            self.dark_frames = 0;
            self.onset = None;
            self.fired = false;
        }
        false
    }

    /// A new pipeline means a fresh feed; any in-progress episode is stale.
    pub fn reset(&mut self) {
        self.dark_frames = 0;
        self.onset = None;
        self.fired = false;
    }

    pub fn consecutive_dark_frames(&self) -> u32 {
        self.dark_frames
    }
}
