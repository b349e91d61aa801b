//! Bounded priority queue for admitted requests

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::{oneshot, Notify};

use crate::optimizer::Plan;
use crate::scheduling::request::{CancelToken, GenerationRequest, GenerationResult, Priority};
use crate::scheduling::{SchedulerError, SchedulerResult};

/// Where a request's outcome goes
pub enum Responder {
    /// Non-streaming: the caller awaits the complete result
    Complete(oneshot::Sender<SchedulerResult<GenerationResult>>),
    /// Streaming: tokens flow to this connection as they are produced
    Stream { connection_id: String },
}

/// An admitted request together with its delivery plumbing
pub struct Submission {
    pub request: GenerationRequest,
    pub cancel: CancelToken,
    pub responder: Responder,
    /// Fingerprint under which the finished result should be cached
    pub cache_key: Option<String>,
    /// Optimization plan computed at admission
    pub plan: Option<Plan>,
}

struct QueuedEntry {
    priority: Priority,
    seq: u64,
    submission: Submission,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher class first, then earlier admission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedEntry>,
    seq: u64,
}

/// Admission queue: strict priority, FIFO within a class, bounded capacity
///
/// Admission never blocks; a full queue rejects immediately. Cancelled
/// entries are dropped lazily when they reach the front.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

impl RequestQueue {
    /// Queue bounded at `capacity` requests
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Admit a submission, or reject with `QueueFull`
    pub fn push(&self, submission: Submission) -> SchedulerResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.heap.len() >= self.capacity {
                return Err(SchedulerError::QueueFull(self.capacity));
            }
            let seq = inner.seq;
            inner.seq += 1;
            inner.heap.push(QueuedEntry {
                priority: submission.request.priority,
                seq,
                submission,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Highest-priority submission, or `None` when empty
    pub fn pop(&self) -> Option<Submission> {
        self.inner.lock().heap.pop().map(|entry| entry.submission)
    }

    /// Wait until something may be available to pop
    pub async fn wait_nonempty(&self) {
        self.notify.notified().await;
    }

    /// Live (non-cancelled) entries waiting for dispatch
    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .heap
            .iter()
            .filter(|entry| !entry.submission.cancel.is_cancelled())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(priority: Priority) -> Submission {
        let (tx, _rx) = oneshot::channel::<SchedulerResult<GenerationResult>>();
        Submission {
            request: GenerationRequest::new("prompt").with_priority(priority),
            cancel: CancelToken::new(),
            responder: Responder::Complete(tx),
            cache_key: None,
            plan: None,
        }
    }

    #[test]
    fn test_priority_order() {
        let queue = RequestQueue::new(10);
        queue.push(submission(Priority::Low)).unwrap();
        queue.push(submission(Priority::Critical)).unwrap();
        queue.push(submission(Priority::Normal)).unwrap();
        queue.push(submission(Priority::High)).unwrap();

        let order: Vec<Priority> = std::iter::from_fn(|| queue.pop())
            .map(|s| s.request.priority)
            .collect();
        assert_eq!(
            order,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Normal,
                Priority::Low
            ]
        );
    }

    #[test]
    fn test_fifo_within_class() {
        let queue = RequestQueue::new(10);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let s = submission(Priority::Normal);
            ids.push(s.request.id.clone());
            queue.push(s).unwrap();
        }

        let popped: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|s| s.request.id)
            .collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_capacity_rejects_without_blocking() {
        let queue = RequestQueue::new(2);
        queue.push(submission(Priority::Normal)).unwrap();
        queue.push(submission(Priority::Normal)).unwrap();
        let err = queue.push(submission(Priority::Critical)).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull(2)));
    }

    #[test]
    fn test_depth_excludes_cancelled() {
        let queue = RequestQueue::new(10);
        let cancelled = submission(Priority::Normal);
        cancelled.cancel.cancel();
        queue.push(cancelled).unwrap();
        queue.push(submission(Priority::Normal)).unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = std::sync::Arc::new(RequestQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_nonempty().await;
                queue.pop().is_some()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(submission(Priority::Normal)).unwrap();
        assert!(waiter.await.unwrap());
    }
}
