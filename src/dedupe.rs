//! Comment-id deduplication.
//!
//! GitHub redelivers webhooks on timeouts and retries; processing the same
//! comment twice would spawn duplicate tasks. Each event kind gets its own
//! deduper so issue-comment and review-comment id spaces never collide.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Remembers comment ids for a retention window (default 12 hours).
pub struct CommentDeduper {
    retention: Duration,
    seen: Mutex<HashMap<u64, Instant>>,
}

impl CommentDeduper {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically record the id; returns true iff it was previously unseen.
    ///
    /// Eviction is piggybacked on every insert: entries older than the
    /// retention window are dropped before the lookup.
    pub fn mark_if_new(&self, comment_id: u64) -> bool {
        let mut seen = self.seen.lock().expect("deduper mutex poisoned");
        let now = Instant::now();

        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.retention);

        match seen.entry(comment_id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().expect("deduper mutex poisoned").len()
    }
}

impl Default for CommentDeduper {
    fn default() -> Self {
        Self::new(Duration::from_secs(12 * 60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_is_new() {
        let deduper = CommentDeduper::default();
        assert!(deduper.mark_if_new(42));
    }

    #[test]
    fn test_repeat_within_window_is_duplicate() {
        let deduper = CommentDeduper::default();
        assert!(deduper.mark_if_new(42));
        assert!(!deduper.mark_if_new(42));
        assert!(!deduper.mark_if_new(42));
    }

    #[test]
    fn test_distinct_ids_are_independent() {
        let deduper = CommentDeduper::default();
        assert!(deduper.mark_if_new(1));
        assert!(deduper.mark_if_new(2));
        assert!(!deduper.mark_if_new(1));
    }

    #[test]
    fn test_eviction_after_retention() {
        let deduper = CommentDeduper::new(Duration::from_millis(10));
        assert!(deduper.mark_if_new(7));
        std::thread::sleep(Duration::from_millis(20));
        // Expired entry is evicted on the next insert, so the id reads as new
        assert!(deduper.mark_if_new(7));
        assert_eq!(deduper.len(), 1);
    }
}
