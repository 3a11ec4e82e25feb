//! Fire-at-most-once callback wrapper.

use parking_lot::Mutex;
use std::fmt;

/// Wraps a callback so it runs at most one time, however many paths race
/// to complete it.
pub struct Once<A> {
    slot: Mutex<Option<Box<dyn FnOnce(A) + Send>>>,
}

impl<A> Once<A> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(A) + Send + 'static,
    {
        Self {
            slot: Mutex::new(Some(Box::new(f))),
        }
    }

    /// Run the callback if it has not run yet. Returns whether it ran.
    pub fn call(&self, arg: A) -> bool {
        let f = self.slot.lock().take();
        match f {
            Some(f) => {
                f(arg);
                true
            }
            None => false,
        }
    }
}

impl<A> fmt::Debug for Once<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once")
            .field("spent", &self.slot.lock().is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let once = Once::new(move |n: usize| {
            h.fetch_add(n, Ordering::SeqCst);
        });

        assert!(once.call(2));
        assert!(!once.call(5));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reentrant_call_is_noop() {
        let once: Arc<Once<()>> = Arc::new(Once::new(|_| {}));
        let inner = once.clone();
        let outer = Once::new(move |_: ()| {
            assert!(inner.call(()));
            assert!(!inner.call(()));
        });
        outer.call(());
    }
}
