use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Identical consecutive messages within this window are suppressed.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Journal entries kept in memory for the since-timestamp query.
const JOURNAL_CAPACITY: usize = 1000;

/// Newest alerts kept; older ones are evicted.
pub const ALERT_CAPACITY: usize = 100;

/// Content-hash suppression map with lazily expired entries. No timer task:
/// expiry is checked on the next lookup of the same hash, and stale entries
/// are swept whenever the map is touched.
#[derive(Debug)]
struct SuppressionMap {
    window: Duration,
    seen: HashMap<u64, Instant>,
}

impl SuppressionMap {
    fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Returns true when the content is new (or its suppression expired) and
    /// records it; false when it should be dropped as a duplicate.
    fn admit(&mut self, hash: u64, now: Instant) -> bool {
        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) < window);

        if self.seen.contains_key(&hash) {
            return false;
        }
        self.seen.insert(hash, now);
        true
    }
}

fn content_hash(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub tag: String,
    pub message: String,
}

/// Append-only event log with duplicate suppression, queryable by timestamp.
/// Every admitted entry is also emitted through `tracing`.
#[derive(Debug)]
pub struct Journal {
    inner: Mutex<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    entries: VecDeque<LogEntry>,
    suppression: SuppressionMap,
}

impl Journal {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            inner: Mutex::new(JournalInner {
                entries: VecDeque::with_capacity(JOURNAL_CAPACITY),
                suppression: SuppressionMap::new(dedup_window),
            }),
        }
    }

    /// Record a tagged event. Duplicates inside the dedup window are dropped
    /// silently; returns whether the entry was admitted.
    pub fn record(&self, tag: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut inner = self.inner.lock();

        if !inner
            .suppression
            .admit(content_hash(&[tag, &message]), Instant::now())
        {
            return false;
        }

        info!(tag, "{}", message);
        if inner.entries.len() == JOURNAL_CAPACITY {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            timestamp: Utc::now(),
            tag: tag.to_string(),
            message,
        });
        true
    }

    /// Entries strictly after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<LogEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Alert {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub message: String,
    pub detected_objects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_confidence: Option<f64>,
    pub status: AlertStatus,
}

/// Bounded alert history with monotonically increasing ids. Shares the
/// journal's suppression policy so a flapping detector cannot flood it.
#[derive(Debug)]
pub struct AlertBook {
    inner: Mutex<AlertBookInner>,
}

#[derive(Debug)]
struct AlertBookInner {
    alerts: VecDeque<Alert>,
    next_id: u64,
    suppression: SuppressionMap,
}

impl AlertBook {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            inner: Mutex::new(AlertBookInner {
                alerts: VecDeque::with_capacity(ALERT_CAPACITY),
                next_id: 1,
                suppression: SuppressionMap::new(dedup_window),
            }),
        }
    }

    /// Raise an alert. Returns its id, or None when suppressed as a duplicate.
    pub fn raise(
        &self,
        severity: AlertSeverity,
        message: impl Into<String>,
        detected_objects: Vec<String>,
        avg_confidence: Option<f64>,
    ) -> Option<u64> {
        let message = message.into();
        let mut inner = self.inner.lock();

        let hash = content_hash(&[severity.as_str(), &message]);
        if !inner.suppression.admit(hash, Instant::now()) {
            return None;
        }

        let id = inner.next_id;
        inner.next_id += 1;

        warn!(alert_id = id, severity = severity.as_str(), "{}", message);

        if inner.alerts.len() == ALERT_CAPACITY {
            inner.alerts.pop_front();
        }
        inner.alerts.push_back(Alert {
            id,
            timestamp: Utc::now(),
            severity,
            message,
            detected_objects,
            avg_confidence,
            status: AlertStatus::Active,
        });
        Some(id)
    }

    /// Mark an alert resolved. Returns false when the id is unknown (evicted
    /// or never issued).
    pub fn acknowledge(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.status = AlertStatus::Resolved;
                true
            }
            None => false,
        }
    }

    /// All retained alerts, newest first.
    pub fn list(&self) -> Vec<Alert> {
        self.inner.lock().alerts.iter().rev().cloned().collect()
    }
}

impl Default for AlertBook {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_suppresses_duplicates_within_window() {
        let journal = Journal::new(Duration::from_secs(5));
        assert!(journal.record("FAILOVER", "switching feeds"));
        assert!(!journal.record("FAILOVER", "switching feeds"));
        // Different content is not suppressed.
        assert!(journal.record("FAILOVER", "switch complete"));
        assert_eq!(journal.since(DateTime::<Utc>::MIN_UTC).len(), 2);
    }

    #[test]
    fn test_journal_allows_duplicate_after_window_expiry() {
        let journal = Journal::new(Duration::from_millis(20));
        assert!(journal.record("PROBE", "timeout"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(journal.record("PROBE", "timeout"));
    }

    #[test]
    fn test_journal_since_is_ascending_and_filtered() {
        let journal = Journal::new(Duration::from_secs(5));
        journal.record("A", "first");
        let cutoff = Utc::now();
        std::thread::sleep(Duration::from_millis(5));
        journal.record("B", "second");
        journal.record("C", "third");

        let entries = journal.since(cutoff);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tag, "B");
        assert_eq!(entries[1].tag, "C");
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }

    #[test]
    fn test_alert_cap_evicts_oldest() {
        let book = AlertBook::new(Duration::from_secs(5));
        for i in 0..150 {
            book.raise(
                AlertSeverity::Critical,
                format!("threat {}", i),
                vec!["knife".to_string()],
                Some(0.9),
            );
        }

        let alerts = book.list();
        assert_eq!(alerts.len(), ALERT_CAPACITY);
        // Newest first; the oldest 50 were evicted.
        assert_eq!(alerts[0].message, "threat 149");
        assert_eq!(alerts.last().map(|a| a.message.as_str()), Some("threat 50"));
    }

    #[test]
    fn test_alert_ids_are_monotonic_across_eviction() {
        let book = AlertBook::new(Duration::from_secs(5));
        let first = book
            .raise(AlertSeverity::Info, "one", Vec::new(), None)
            .unwrap();
        let second = book
            .raise(AlertSeverity::Info, "two", Vec::new(), None)
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_alert_dedup_and_acknowledge() {
        let book = AlertBook::new(Duration::from_secs(5));
        let id = book
            .raise(AlertSeverity::Critical, "knife seen", vec![], Some(0.8))
            .unwrap();
        assert!(book
            .raise(AlertSeverity::Critical, "knife seen", vec![], Some(0.8))
            .is_none());

        assert!(book.acknowledge(id));
        assert_eq!(book.list()[0].status, AlertStatus::Resolved);
        assert!(!book.acknowledge(9999));
    }
}
