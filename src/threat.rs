use crate::config::ThreatConfig;
use crate::frame::Prediction;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Detection classes that count as threats. Matching is substring-based and
/// case-insensitive, so "Kitchen Knife" matches "knife".
pub const THREAT_VOCABULARY: &[&str] = &[
    "knife", "gun", "pistol", "rifle", "weapon", "blade", "sword", "machete", "axe", "hammer",
    "crowbar", "bat", "stick", "rod",
];

/// Classes explicitly excluded from threat matching. Exclusion wins: a label
/// matching both lists is never a threat.
pub const NON_THREAT_VOCABULARY: &[&str] = &["person", "people", "human"];

/// Bound on the recent-events ring; entries past the sliding window are
/// purged lazily, this cap just keeps the structure from growing unbounded.
pub const EVENT_RING_CAPACITY: usize = 100;

/// Whether a detection class label counts as a threat.
pub fn is_threat_label(label: &str) -> bool {
    let lower = label.to_lowercase();
    if NON_THREAT_VOCABULARY.iter().any(|nt| lower.contains(nt)) {
        return false;
    }
    THREAT_VOCABULARY.iter().any(|t| lower.contains(t))
}

/// Outcome of feeding one frame's detections through the window.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatFrameReport {
    /// Distinct threat labels seen in the frame, original casing
    pub labels: Vec<String>,
    /// Labels that were actually counted this frame (cooldown expired)
    pub counted: Vec<String>,
    /// Average confidence across the frame's threat detections
    pub avg_confidence: f64,
    /// Counted events remaining inside the sliding window
    pub window_count: usize,
    /// Whether a recording start was requested
    pub trigger: bool,
}

/// Sliding-window, cooldown-deduplicated threat counter.
///
/// One sustained detection of the same object must not inflate the window
/// every frame, so each label is counted at most once per cooldown period.
/// When the count inside the window reaches the threshold and no recording is
/// active, a recording trigger is reported and both the event ring and the
/// cooldown table are cleared — deliberately, so the same burst cannot
/// re-trigger the moment the recording ends, at the cost of a brief blind
/// restart of accumulation.
#[derive(Debug)]
pub struct ThreatWindow {
    cooldown: Duration,
    window: Duration,
    threshold: usize,
    last_counted: HashMap<String, Instant>,
    events: VecDeque<Instant>,
}

impl ThreatWindow {
    pub fn new(config: &ThreatConfig) -> Self {
        Self {
            cooldown: Duration::from_secs_f64(config.cooldown_secs),
            window: Duration::from_secs_f64(config.window_secs),
            threshold: config.trigger_threshold,
            last_counted: HashMap::new(),
            events: VecDeque::with_capacity(EVENT_RING_CAPACITY),
        }
    }

    /// Feed one frame's detections (already confidence-filtered) through the
    /// window. Returns None when the frame contains no newly counted threat.
    pub fn observe(
        &mut self,
        predictions: &[Prediction],
        recording_active: bool,
        now: Instant,
    ) -> Option<ThreatFrameReport> {
        let threats: Vec<&Prediction> = predictions
            .iter()
            .filter(|p| is_threat_label(&p.label))
            .collect();

        if threats.is_empty() {
            return None;
        }

        let mut labels: Vec<String> = Vec::new();
        for threat in &threats {
            if !labels.iter().any(|l| l == &threat.label) {
                labels.push(threat.label.clone());
            }
        }

        let mut counted = Vec::new();
        for label in &labels {
            let key = label.to_lowercase();
            let expired = self
                .last_counted
                .get(&key)
                .map_or(true, |last| now.duration_since(*last) >= self.cooldown);

            if expired {
                if self.events.len() == EVENT_RING_CAPACITY {
                    self.events.pop_front();
                }
                self.events.push_back(now);
                self.last_counted.insert(key, now);
                counted.push(label.clone());
            }
        }

        if counted.is_empty() {
            return None;
        }

        let avg_confidence =
            threats.iter().map(|p| p.confidence as f64).sum::<f64>() / threats.len() as f64;

        self.purge(now);
        let window_count = self.events.len();

        let trigger = !recording_active && window_count >= self.threshold;
        if trigger {
            debug!(
                "Threat threshold met: {} events in window; clearing window state",
                window_count
            );
            self.events.clear();
            self.last_counted.clear();
        }

        Some(ThreatFrameReport {
            labels,
            counted,
            avg_confidence,
            window_count,
            trigger,
        })
    }

    fn purge(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if now.duration_since(*oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn window_count(&self, now: Instant) -> usize {
        self.events
            .iter()
            .filter(|t| now.duration_since(**t) <= self.window)
            .count()
    }
}
