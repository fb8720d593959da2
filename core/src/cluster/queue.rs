// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Priority queue of waiting jobs.
//!
//! Ordered by `(-priority, created_at, id)`: higher priority wins, then
//! older submission, with the id as a stable final tiebreak. Removal is
//! tombstone-based so it stays `O(log n)`; dead entries are discarded
//! lazily during pops.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::cluster::types::JobId;

/// Outcome of inspecting a candidate entry during [`JobQueue::pop_best_matching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopDecision {
    /// Dispatch this job; skipped entries are re-inserted unchanged
    Take,
    /// Not dispatchable right now; keep it in the queue
    Keep,
    /// Entry is stale (job gone or no longer queued); drop it
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    job_id: JobId,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the greatest entry is dispatched first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    live: HashSet<JobId>,
    removed: HashSet<JobId>,
}

/// Priority-ordered waiting set with FIFO tie-break.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a job under its ordering key. Re-pushing after a requeue must
    /// pass the original `created_at` so retries keep their position.
    pub fn push(&self, job_id: JobId, priority: i32, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.removed.remove(&job_id);
        inner.live.insert(job_id.clone());
        inner.heap.push(QueueEntry {
            priority,
            created_at,
            job_id,
        });
    }

    /// Pop the best entry for which `decide` returns [`PopDecision::Take`].
    ///
    /// Entries judged [`PopDecision::Keep`] are re-inserted with their
    /// original keys once the scan ends, so their relative order is
    /// preserved. `O(k log n)` where `k` is the number of skipped entries.
    pub fn pop_best_matching<F>(&self, mut decide: F) -> Option<JobId>
    where
        F: FnMut(&JobId) -> PopDecision,
    {
        let mut inner = self.inner.lock();
        let mut skipped = Vec::new();
        let mut taken = None;

        while let Some(entry) = inner.heap.pop() {
            if inner.removed.remove(&entry.job_id) {
                continue;
            }
            match decide(&entry.job_id) {
                PopDecision::Take => {
                    inner.live.remove(&entry.job_id);
                    taken = Some(entry.job_id);
                    break;
                }
                PopDecision::Keep => skipped.push(entry),
                PopDecision::Drop => {
                    inner.live.remove(&entry.job_id);
                }
            }
        }

        for entry in skipped {
            inner.heap.push(entry);
        }
        taken
    }

    /// Remove a job from the waiting set. Returns `false` when the job was
    /// not queued. The heap entry is tombstoned and discarded on a later pop.
    pub fn remove(&self, job_id: &JobId) -> bool {
        let mut inner = self.inner.lock();
        if inner.live.remove(job_id) {
            inner.removed.insert(job_id.clone());
            true
        } else {
            false
        }
    }

    /// Peek at the id of the current head without removing it.
    pub fn peek_head(&self) -> Option<JobId> {
        let mut inner = self.inner.lock();
        loop {
            let head_is_stale = match inner.heap.peek() {
                Some(entry) => inner.removed.contains(&entry.job_id),
                None => return None,
            };
            if head_is_stale {
                if let Some(entry) = inner.heap.pop() {
                    inner.removed.remove(&entry.job_id);
                }
            } else {
                return inner.heap.peek().map(|e| e.job_id.clone());
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Whether the waiting set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(offset_secs: i64) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(offset_secs)
    }

    #[test]
    fn test_priority_wins_over_age() {
        let queue = JobQueue::new();
        queue.push("old-low".to_string(), 1, at(0));
        queue.push("new-high".to_string(), 5, at(5));

        assert_eq!(queue.peek_head().as_deref(), Some("new-high"));
        let first = queue.pop_best_matching(|_| PopDecision::Take);
        assert_eq!(first.as_deref(), Some("new-high"));
        let second = queue.pop_best_matching(|_| PopDecision::Take);
        assert_eq!(second.as_deref(), Some("old-low"));
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = JobQueue::new();
        queue.push("second".to_string(), 2, at(1));
        queue.push("first".to_string(), 2, at(0));

        assert_eq!(
            queue.pop_best_matching(|_| PopDecision::Take).as_deref(),
            Some("first")
        );
        assert_eq!(
            queue.pop_best_matching(|_| PopDecision::Take).as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_id_tiebreak_is_stable() {
        let queue = JobQueue::new();
        let now = at(0);
        queue.push("b".to_string(), 1, now);
        queue.push("a".to_string(), 1, now);

        assert_eq!(
            queue.pop_best_matching(|_| PopDecision::Take).as_deref(),
            Some("a")
        );
    }

    #[test]
    fn test_skipped_entries_keep_order() {
        let queue = JobQueue::new();
        queue.push("high".to_string(), 9, at(0));
        queue.push("mid".to_string(), 5, at(0));
        queue.push("low".to_string(), 1, at(0));

        // Only "mid" is dispatchable this round.
        let taken = queue.pop_best_matching(|id| {
            if id == "mid" {
                PopDecision::Take
            } else {
                PopDecision::Keep
            }
        });
        assert_eq!(taken.as_deref(), Some("mid"));
        assert_eq!(queue.len(), 2);

        // The skipped entries come back in their original order.
        assert_eq!(
            queue.pop_best_matching(|_| PopDecision::Take).as_deref(),
            Some("high")
        );
        assert_eq!(
            queue.pop_best_matching(|_| PopDecision::Take).as_deref(),
            Some("low")
        );
    }

    #[test]
    fn test_no_match_leaves_queue_intact() {
        let queue = JobQueue::new();
        queue.push("a".to_string(), 1, at(0));
        queue.push("b".to_string(), 2, at(0));

        assert!(queue.pop_best_matching(|_| PopDecision::Keep).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek_head().as_deref(), Some("b"));
    }

    #[test]
    fn test_remove_tombstones_entry() {
        let queue = JobQueue::new();
        queue.push("a".to_string(), 1, at(0));
        queue.push("b".to_string(), 2, at(0));

        assert!(queue.remove(&"b".to_string()));
        assert!(!queue.remove(&"b".to_string()));
        assert!(!queue.remove(&"missing".to_string()));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_head().as_deref(), Some("a"));
        assert_eq!(
            queue.pop_best_matching(|_| PopDecision::Take).as_deref(),
            Some("a")
        );
        assert!(queue.pop_best_matching(|_| PopDecision::Take).is_none());
    }

    #[test]
    fn test_drop_discards_stale_entries() {
        let queue = JobQueue::new();
        queue.push("stale".to_string(), 9, at(0));
        queue.push("live".to_string(), 1, at(0));

        let taken = queue.pop_best_matching(|id| {
            if id == "stale" {
                PopDecision::Drop
            } else {
                PopDecision::Take
            }
        });
        assert_eq!(taken.as_deref(), Some("live"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_with_original_created_at_keeps_position() {
        let queue = JobQueue::new();
        let original = at(0);
        queue.push("retried".to_string(), 3, original);
        queue.push("younger".to_string(), 3, at(10));

        // Simulate a requeue after node loss: same key, same position.
        let popped = queue.pop_best_matching(|_| PopDecision::Take).unwrap();
        assert_eq!(popped, "retried");
        queue.push("retried".to_string(), 3, original);

        assert_eq!(
            queue.pop_best_matching(|_| PopDecision::Take).as_deref(),
            Some("retried")
        );
    }
}
