//! TTL countdown queue.
//!
//! A min-heap of absolute expiry deadlines over keys. Entries are never
//! removed eagerly when a key is refreshed or superseded; instead each
//! popped entry is validated against the live store value — an entry whose
//! `(version, originator_id, ttl_version)` no longer matches is stale and
//! silently dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use trellis_types::Value;

/// One countdown record for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlEntry {
    /// Absolute deadline at which the key expires.
    pub expires_at: Instant,
    /// Key under countdown.
    pub key: String,
    /// Version of the value the countdown was armed for.
    pub version: i64,
    /// Originator of the value the countdown was armed for.
    pub originator_id: String,
    /// TTL version the countdown was armed for.
    pub ttl_version: i64,
}

impl Ord for TtlEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.ttl_version.cmp(&other.ttl_version))
    }
}

impl PartialOrd for TtlEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-queue of key expiry deadlines.
#[derive(Debug, Default)]
pub struct TtlQueue {
    heap: BinaryHeap<Reverse<TtlEntry>>,
}

impl TtlQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a countdown for `value` under `key`, expiring `ttl_ms` from
    /// `now`. Immortal values are not tracked.
    pub fn schedule(&mut self, now: Instant, key: &str, value: &Value) {
        if value.is_immortal() {
            return;
        }
        let expires_at = now + std::time::Duration::from_millis(value.ttl_ms.max(0) as u64);
        self.heap.push(Reverse(TtlEntry {
            expires_at,
            key: key.to_string(),
            version: value.version,
            originator_id: value.originator_id.clone(),
            ttl_version: value.ttl_version,
        }));
    }

    /// The earliest deadline in the queue, stale entries included.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.expires_at)
    }

    /// Pops every entry due at `now`.
    ///
    /// The caller must validate each entry against the live store before
    /// treating it as an expiration.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TtlEntry> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.expires_at > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Returns true when `entry` still matches the live `value` it was
    /// armed for.
    pub fn entry_is_current(entry: &TtlEntry, value: &Value) -> bool {
        entry.version == value.version
            && entry.originator_id == value.originator_id
            && entry.ttl_version == value.ttl_version
    }

    /// Number of countdown records, stale entries included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when no countdown records exist.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use trellis_types::TTL_INFINITY;

    use super::*;

    fn val(version: i64, ttl_ms: i64, ttl_version: i64) -> Value {
        Value::new(version, "node1", Some(b"v".to_vec()), ttl_ms, ttl_version)
    }

    #[test]
    fn test_pop_due_respects_deadlines() {
        let mut queue = TtlQueue::new();
        let now = Instant::now();
        queue.schedule(now, "k1", &val(1, 100, 1));
        queue.schedule(now, "k2", &val(1, 300, 1));

        assert!(queue.pop_due(now).is_empty());

        let due = queue.pop_due(now + Duration::from_millis(150));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "k1");

        let due = queue.pop_due(now + Duration::from_millis(400));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "k2");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_immortal_values_not_tracked() {
        let mut queue = TtlQueue::new();
        queue.schedule(Instant::now(), "k1", &val(1, TTL_INFINITY, 1));
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_next_deadline_is_minimum() {
        let mut queue = TtlQueue::new();
        let now = Instant::now();
        queue.schedule(now, "slow", &val(1, 500, 1));
        queue.schedule(now, "fast", &val(1, 100, 1));
        let deadline = queue.next_deadline().unwrap();
        assert!(deadline <= now + Duration::from_millis(100));
    }

    #[test]
    fn test_stale_entry_detection() {
        let armed_for = val(1, 100, 1);
        let mut queue = TtlQueue::new();
        queue.schedule(Instant::now(), "k1", &armed_for);
        let entry = &queue.pop_due(Instant::now() + Duration::from_millis(200))[0];

        assert!(TtlQueue::entry_is_current(entry, &armed_for));
        // Version bumped since the countdown was armed.
        assert!(!TtlQueue::entry_is_current(entry, &val(2, 100, 1)));
        // TTL refreshed since the countdown was armed.
        assert!(!TtlQueue::entry_is_current(entry, &val(1, 100, 2)));
    }
}
