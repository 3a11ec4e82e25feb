//! Event loop implementation
//!
//! Cooperative, single-threaded loop with two queues: next-tick jobs, which
//! always run first, and microtasks. Each OS thread owns one loop, reachable
//! through [`EventLoop::current`].

use crate::microtask::MicrotaskQueue;
use futures_util::task::noop_waker_ref;
use std::cell::Cell;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

thread_local! {
    static CURRENT: Arc<EventLoop> = Arc::new(EventLoop::new());

    /// Nesting depth of `run_until_idle` on this thread
    static DRAIN_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Event loop for deferred stream work
pub struct EventLoop {
    /// `process.nextTick`-style queue, drained before microtasks
    next_ticks: MicrotaskQueue,
    /// Microtask queue (promise reactions)
    microtasks: MicrotaskQueue,
    /// Total number of jobs executed by this loop
    executed: AtomicU64,
    /// Is currently draining
    running: AtomicBool,
}

impl EventLoop {
    /// Create a standalone loop. Most callers want [`EventLoop::current`].
    pub fn new() -> Self {
        Self {
            next_ticks: MicrotaskQueue::new(),
            microtasks: MicrotaskQueue::new(),
            executed: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// The loop owned by the calling thread.
    pub fn current() -> Arc<EventLoop> {
        CURRENT.with(Arc::clone)
    }

    /// Schedule a job to run before any pending microtask.
    pub fn next_tick<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.next_ticks.enqueue(task);
    }

    /// Schedule a job after every pending next-tick job.
    pub fn queue_microtask<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.microtasks.enqueue(task);
    }

    /// Whether any job is waiting to run.
    pub fn has_pending_work(&self) -> bool {
        !self.next_ticks.is_empty() || !self.microtasks.is_empty()
    }

    /// Number of queued jobs across both queues.
    pub fn pending(&self) -> usize {
        self.next_ticks.len() + self.microtasks.len()
    }

    /// Whether the loop is inside `run_until_idle`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Total number of jobs this loop has executed.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Run a single job, preferring the next-tick queue.
    ///
    /// Returns `false` when both queues are empty.
    pub fn run_once(&self) -> bool {
        let task = self
            .next_ticks
            .dequeue()
            .or_else(|| self.microtasks.dequeue());
        match task {
            Some(task) => {
                task();
                self.executed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drain both queues until no job is left, including jobs scheduled while
    /// draining. Returns the number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let depth = DRAIN_DEPTH.with(|d| {
            let depth = d.get() + 1;
            d.set(depth);
            depth
        });
        let was_running = self.running.swap(true, Ordering::AcqRel);

        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }

        if !was_running {
            self.running.store(false, Ordering::Release);
        }
        DRAIN_DEPTH.with(|d| d.set(depth - 1));
        if ran > 0 {
            tracing::trace!(ran, depth, "event loop idle");
        }
        ran
    }

    /// Drive `future` to completion by interleaving polls with queued jobs.
    ///
    /// Returns `None` if the loop runs out of work while the future is still
    /// pending; nothing else could ever wake it.
    pub fn block_on<F: Future>(&self, future: F) -> Option<F::Output> {
        let mut future = pin!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Some(output);
            }
            if !self.run_once() {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Some(output);
                }
                tracing::debug!("block_on: event loop idle with pending future");
                return None;
            }
        }
    }

    /// Drop every queued job without running it.
    pub fn clear(&self) {
        self.next_ticks.clear();
        self.microtasks.clear();
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Schedule `task` on the current thread's next-tick queue.
pub fn next_tick<F>(task: F)
where
    F: FnOnce() + Send + 'static,
{
    EventLoop::current().next_tick(task);
}

/// Schedule `task` on the current thread's microtask queue.
pub fn queue_microtask<F>(task: F)
where
    F: FnOnce() + Send + 'static,
{
    EventLoop::current().queue_microtask(task);
}

/// Drain the current thread's loop. Returns the number of jobs run.
pub fn run_until_idle() -> usize {
    EventLoop::current().run_until_idle()
}

/// Drive `future` on the current thread's loop.
pub fn block_on<F: Future>(future: F) -> Option<F::Output> {
    EventLoop::current().block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_next_tick_runs_before_microtasks() {
        let event_loop = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        event_loop.queue_microtask(move || o.lock().push("microtask"));
        let o = order.clone();
        event_loop.next_tick(move || o.lock().push("tick"));

        assert_eq!(event_loop.run_until_idle(), 2);
        assert_eq!(*order.lock(), vec!["tick", "microtask"]);
    }

    #[test]
    fn test_jobs_scheduled_while_draining_run_in_same_drain() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        next_tick(move || {
            o.lock().push(1);
            let o2 = o.clone();
            next_tick(move || o2.lock().push(3));
            o.lock().push(2);
        });

        assert_eq!(run_until_idle(), 2);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert!(!EventLoop::current().has_pending_work());
    }

    #[test]
    fn test_nothing_runs_synchronously() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        next_tick(move || r.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
        run_until_idle();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_block_on_resolves_through_queued_work() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        next_tick(move || {
            let _ = tx.send(42);
        });
        assert_eq!(block_on(rx), Some(Ok(42)));
    }

    #[test]
    fn test_block_on_returns_none_when_idle() {
        let (_tx, rx) = tokio::sync::oneshot::channel::<()>();
        assert!(block_on(rx).is_none());
    }

    #[test]
    fn test_clear_drops_jobs() {
        let event_loop = EventLoop::new();
        event_loop.next_tick(|| panic!("must not run"));
        assert_eq!(event_loop.pending(), 1);
        event_loop.clear();
        assert_eq!(event_loop.run_until_idle(), 0);
    }
}
