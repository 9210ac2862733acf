//! Inbox batcher for the change feed.
//!
//! Coalesces revisions into fixed-size or time-bounded batches so that one
//! `_revs_diff` round-trip covers many revisions.
//!
//! ```text
//! change feed ──▶ Inbox ──┬──▶ flush at capacity (100)
//!                         ├──▶ flush when the timer elapses (~500 ms)
//!                         └──▶ forced flush when the scan ends
//! ```
//!
//! The inbox owns no I/O; the driver asks [`should_flush`](Inbox::should_flush)
//! between events and [`time_until_flush`](Inbox::time_until_flush) when it
//! needs a wakeup for a partially-filled batch.

use crate::config::InboxConfig;
use crate::revision::{Revision, RevisionList};
use std::time::{Duration, Instant};
use tracing::trace;

/// Accumulates revisions until a batch is worth diffing.
pub struct Inbox {
    pending: RevisionList,
    batch_start: Option<Instant>,
    capacity: usize,
    flush_delay: Duration,
}

impl Inbox {
    pub fn new(config: &InboxConfig) -> Self {
        Self {
            pending: RevisionList::new(),
            batch_start: None,
            capacity: config.capacity,
            flush_delay: config.flush_delay_duration(),
        }
    }

    /// Add a revision to the current batch.
    ///
    /// Duplicate `(doc_id, rev_id)` pairs coalesce to a single entry.
    pub fn add(&mut self, rev: Revision) {
        if self.batch_start.is_none() {
            self.batch_start = Some(Instant::now());
        }
        trace!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, seq = rev.sequence, "inbox add");
        self.pending.push(rev);
    }

    /// Check if the batch should be flushed.
    pub fn should_flush(&self) -> bool {
        if self.pending.len() >= self.capacity {
            return true;
        }
        if let Some(start) = self.batch_start {
            if start.elapsed() >= self.flush_delay {
                return true;
            }
        }
        false
    }

    /// Time remaining until the timer would force a flush.
    ///
    /// `None` when the inbox is empty (nothing to wait for);
    /// `Some(Duration::ZERO)` when a flush is already due.
    pub fn time_until_flush(&self) -> Option<Duration> {
        let start = self.batch_start?;
        if self.pending.len() >= self.capacity {
            return Some(Duration::ZERO);
        }
        Some(self.flush_delay.saturating_sub(start.elapsed()))
    }

    /// Take the current batch, resetting the timer.
    pub fn flush(&mut self) -> RevisionList {
        self.batch_start = None;
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inbox(capacity: usize, delay_ms: u64) -> Inbox {
        Inbox::new(&InboxConfig {
            capacity,
            flush_delay: format!("{}ms", delay_ms),
        })
    }

    #[test]
    fn test_flush_by_size() {
        let mut inbox = test_inbox(3, 60_000);

        inbox.add(Revision::new("a", "1-a", 1));
        assert!(!inbox.should_flush());

        inbox.add(Revision::new("b", "1-b", 2));
        assert!(!inbox.should_flush());

        inbox.add(Revision::new("c", "1-c", 3));
        assert!(inbox.should_flush());

        let batch = inbox.flush();
        assert_eq!(batch.len(), 3);
        assert!(inbox.is_empty());
        assert!(!inbox.should_flush());
    }

    #[tokio::test]
    async fn test_flush_by_time() {
        let mut inbox = test_inbox(1000, 10);

        inbox.add(Revision::new("a", "1-a", 1));
        assert!(!inbox.should_flush());

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(inbox.should_flush());
    }

    #[test]
    fn test_duplicate_revisions_coalesce() {
        let mut inbox = test_inbox(100, 500);
        inbox.add(Revision::new("a", "1-a", 1));
        inbox.add(Revision::new("a", "1-a", 1));
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn test_time_until_flush_empty() {
        let inbox = test_inbox(100, 500);
        assert!(inbox.time_until_flush().is_none());
    }

    #[test]
    fn test_time_until_flush_counts_down() {
        let mut inbox = test_inbox(100, 500);
        inbox.add(Revision::new("a", "1-a", 1));
        let remaining = inbox.time_until_flush().unwrap();
        assert!(remaining <= Duration::from_millis(500));
        assert!(remaining > Duration::from_millis(400));
    }

    #[test]
    fn test_time_until_flush_zero_at_capacity() {
        let mut inbox = test_inbox(2, 60_000);
        inbox.add(Revision::new("a", "1-a", 1));
        inbox.add(Revision::new("b", "1-b", 2));
        assert_eq!(inbox.time_until_flush(), Some(Duration::ZERO));
    }

    #[test]
    fn test_empty_flush() {
        let mut inbox = test_inbox(100, 500);
        let batch = inbox.flush();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_timer_resets_after_flush() {
        let mut inbox = test_inbox(100, 500);
        inbox.add(Revision::new("a", "1-a", 1));
        let _ = inbox.flush();
        assert!(inbox.time_until_flush().is_none());
    }
}
