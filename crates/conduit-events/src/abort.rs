//! `AbortController` / `AbortSignal`.
//!
//! A signal flips to aborted at most once, keeps the first reason it was
//! given and notifies its `abort` listeners exactly once.

use crate::emitter::{EventEmitter, ListenerId};
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a signal was aborted.
pub type AbortReason = Arc<dyn StdError + Send + Sync>;

/// Default abort reason.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("This operation was aborted")]
pub struct AbortedError;

struct SignalInner {
    reason: Mutex<Option<AbortReason>>,
    events: EventEmitter<AbortReason>,
}

/// Read side of an [`AbortController`].
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                reason: Mutex::new(None),
                events: EventEmitter::new(),
            }),
        }
    }

    /// A signal that is already aborted.
    pub fn abort(reason: Option<AbortReason>) -> Self {
        let signal = Self::new();
        signal.trigger(reason);
        signal
    }

    pub fn aborted(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.lock().clone()
    }

    /// Return the abort reason as an error if the signal has fired.
    pub fn throw_if_aborted(&self) -> Result<(), AbortReason> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Register `f` to run when the signal aborts.
    ///
    /// Listeners registered after the signal fired are never called; check
    /// [`AbortSignal::aborted`] first.
    pub fn on_abort<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&AbortReason) + Send + Sync + 'static,
    {
        self.inner.events.once("abort", f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.off("abort", id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.events.listener_count("abort")
    }

    /// Whether both handles observe the same signal.
    pub fn same(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn trigger(&self, reason: Option<AbortReason>) -> bool {
        let reason = {
            let mut slot = self.inner.reason.lock();
            if slot.is_some() {
                return false;
            }
            let reason = reason.unwrap_or_else(|| Arc::new(AbortedError));
            *slot = Some(reason.clone());
            reason
        };
        tracing::trace!(%reason, "abort signal fired");
        self.inner.events.emit("abort", &reason);
        true
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .finish()
    }
}

/// Owner side: aborts its [`AbortSignal`].
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort with `reason` (or [`AbortedError`]). Only the first call has any
    /// effect; returns whether this call aborted the signal.
    pub fn abort(&self, reason: Option<AbortReason>) -> bool {
        self.signal.trigger(reason)
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Error)]
    #[error("shutting down")]
    struct Shutdown;

    #[test]
    fn test_abort_fires_listeners_once() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        signal.on_abort(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!signal.aborted());
        assert!(controller.abort(None));
        assert!(!controller.abort(None));
        assert!(signal.aborted());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_first_reason_wins() {
        let controller = AbortController::new();
        controller.abort(Some(Arc::new(Shutdown)));
        controller.abort(None);

        let reason = controller.signal().reason().unwrap();
        assert_eq!(reason.to_string(), "shutting down");
        assert!(controller.signal().throw_if_aborted().is_err());
    }

    #[test]
    fn test_default_reason() {
        let signal = AbortSignal::abort(None);
        assert!(signal.aborted());
        assert_eq!(
            signal.reason().unwrap().to_string(),
            "This operation was aborted"
        );
    }

    #[test]
    fn test_removed_listener_not_called() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let id = signal.on_abort(|_| panic!("removed listener called"));
        assert!(signal.remove_listener(id));
        controller.abort(None);
        assert!(signal.same(&controller.signal()));
    }
}
