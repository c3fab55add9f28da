use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub key: String,
    pub added: DateTime<Utc>,
    pub status: QueueStatus,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<String, QueueEntry>,
    next_seq: u64,
}

/// Keys waiting for, or undergoing, conversion. At most one entry exists per
/// key; an entry disappears as soon as its conversion attempt finishes.
#[derive(Debug, Default)]
pub struct ConversionQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

/// How a wait on a queued key ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Done,
    Cancelled,
}

impl ConversionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `key` as pending. Returns false when the key is already queued in
    /// any state.
    pub fn enqueue(&self, key: &str) -> bool {
        let mut state = self.lock();
        if state.entries.contains_key(key) {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key.to_string(),
            QueueEntry {
                key: key.to_string(),
                added: Utc::now(),
                status: QueueStatus::Pending,
                seq,
            },
        );
        true
    }

    pub fn is_queued(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn status(&self, key: &str) -> Option<QueueStatus> {
        self.lock().entries.get(key).map(|entry| entry.status)
    }

    /// Pending keys, oldest request first.
    pub fn pending(&self) -> Vec<String> {
        let state = self.lock();
        let mut pending: Vec<&QueueEntry> = state
            .entries
            .values()
            .filter(|entry| entry.status == QueueStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.added.cmp(&b.added).then(a.seq.cmp(&b.seq)));
        pending.into_iter().map(|entry| entry.key.clone()).collect()
    }

    /// Moves a pending key to in-progress. Returns false when the key is not
    /// pending.
    pub fn mark_in_progress(&self, key: &str) -> bool {
        match self.lock().entries.get_mut(key) {
            Some(entry) if entry.status == QueueStatus::Pending => {
                entry.status = QueueStatus::InProgress;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.lock().entries.remove(key).is_some();
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let state = self.lock();
        let mut entries: Vec<QueueEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.added.cmp(&b.added).then(a.seq.cmp(&b.seq)));
        entries
    }

    /// Suspends until `key` leaves the queue or `cancel` resolves.
    ///
    /// Removal wakes waiters immediately; `poll_interval` bounds each sleep so
    /// a missed notification only delays the check.
    pub async fn wait_until_done<C>(
        &self,
        key: &str,
        poll_interval: StdDuration,
        cancel: C,
    ) -> WaitOutcome
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if !self.is_queued(key) {
                return WaitOutcome::Done;
            }
            tokio::select! {
                _ = &mut cancel => return WaitOutcome::Cancelled,
                _ = &mut changed => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn enqueue_is_idempotent() {
        let queue = ConversionQueue::new();
        assert!(queue.enqueue("abc"));
        assert!(!queue.enqueue("abc"));
        assert!(queue.mark_in_progress("abc"));
        assert!(!queue.enqueue("abc"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.status("abc"), Some(QueueStatus::InProgress));
    }

    #[test]
    fn pending_orders_by_request_time() {
        let queue = ConversionQueue::new();
        for key in ["c", "a", "b"] {
            queue.enqueue(key);
        }
        queue.mark_in_progress("a");
        assert_eq!(queue.pending(), vec!["c".to_string(), "b".to_string()]);
        assert!(!queue.mark_in_progress("a"));
        assert!(!queue.mark_in_progress("missing"));
    }

    #[test]
    fn remove_clears_entry() {
        let queue = ConversionQueue::new();
        queue.enqueue("abc");
        assert!(queue.remove("abc"));
        assert!(!queue.remove("abc"));
        assert!(queue.is_empty());
        assert!(queue.enqueue("abc"));
    }

    #[tokio::test]
    async fn waiter_wakes_on_removal() {
        let queue = Arc::new(ConversionQueue::new());
        queue.enqueue("abc");
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .wait_until_done("abc", StdDuration::from_secs(60), std::future::pending())
                    .await
            })
        };
        tokio::task::yield_now().await;
        queue.remove("abc");
        let outcome = tokio::time::timeout(StdDuration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_entry() {
        let queue = ConversionQueue::new();
        queue.enqueue("abc");
        let outcome = queue
            .wait_until_done("abc", StdDuration::from_millis(10), async {})
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(queue.is_queued("abc"));
    }

    #[tokio::test]
    async fn absent_key_is_done_immediately() {
        let queue = ConversionQueue::new();
        let outcome = queue
            .wait_until_done("abc", StdDuration::from_millis(10), std::future::pending())
            .await;
        assert_eq!(outcome, WaitOutcome::Done);
    }
}
