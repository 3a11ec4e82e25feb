//! Deferred job queues.
//!
//! ## Ordering Guarantees
//!
//! - FIFO: First queued, first executed
//! - Every pending next-tick job runs before any microtask in the same drain cycle
//! - Jobs enqueued while a queue is being drained run in the same drain cycle

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deferred job (Rust closure)
pub type Microtask = Box<dyn FnOnce() + Send>;

/// FIFO queue of jobs.
///
/// Both the microtask queue and the next-tick queue are instances of this
/// type; the event loop decides which one is drained first.
pub struct MicrotaskQueue {
    queue: Mutex<VecDeque<Microtask>>,
    len: AtomicUsize,
}

impl MicrotaskQueue {
    /// Create new empty queue
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Add a job to the queue
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.lock().push_back(Box::new(task));
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the next job
    pub fn dequeue(&self) -> Option<Microtask> {
        let task = self.queue.lock().pop_front();
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        task
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Relaxed) == 0
    }

    /// Clear all pending jobs
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        let len = queue.len();
        queue.clear();
        self.len.fetch_sub(len, Ordering::Relaxed);
    }
}

impl Default for MicrotaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = MicrotaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            queue.enqueue(move || seen.lock().push(i));
        }
        assert_eq!(queue.len(), 3);
        while let Some(task) = queue.dequeue() {
            task();
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_job_enqueued_while_draining_runs_last() {
        let queue = Arc::new(MicrotaskQueue::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (q, s) = (queue.clone(), seen.clone());
        queue.enqueue(move || {
            s.lock().push("first");
            let s = s.clone();
            q.enqueue(move || s.lock().push("nested"));
        });
        let s = seen.clone();
        queue.enqueue(move || s.lock().push("second"));

        while let Some(task) = queue.dequeue() {
            task();
        }
        assert_eq!(*seen.lock(), vec!["first", "second", "nested"]);
    }

    #[test]
    fn test_clear() {
        let queue = MicrotaskQueue::new();
        queue.enqueue(|| {});
        queue.enqueue(|| panic!("cleared job ran"));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert!(queue.dequeue().is_none());
    }
}
