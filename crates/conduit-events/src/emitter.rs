//! Node.js-style `EventEmitter`.
//!
//! Listeners are Rust closures keyed by event name. Every registration gets a
//! [`ListenerId`] so it can be removed later without comparing closures.
//!
//! # Example
//!
//! ```
//! use conduit_events::EventEmitter;
//!
//! let emitter: EventEmitter<String> = EventEmitter::new();
//! emitter.on("data", |chunk: &String| println!("{chunk}"));
//! assert!(emitter.emit("data", &"Hello!".to_string()));
//! ```

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default maximum number of listeners per event.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Unique listener ID for tracking callbacks.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique listener ID.
fn next_listener_id() -> ListenerId {
    ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst))
}

/// Handle returned by every registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Listener callback.
pub type ListenerFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Represents a registered event listener.
pub struct Listener<T> {
    /// Unique identifier for this listener.
    pub id: ListenerId,

    /// Whether this is a one-time listener (added via `once`).
    pub once: bool,

    /// Whether this listener should be called before others (prepend).
    pub prepend: bool,

    callback: ListenerFn<T>,
}

impl<T> Listener<T> {
    /// Create a new regular listener.
    pub fn new(callback: ListenerFn<T>) -> Self {
        Self {
            id: next_listener_id(),
            once: false,
            prepend: false,
            callback,
        }
    }

    /// Create a new one-time listener.
    pub fn once(callback: ListenerFn<T>) -> Self {
        Self {
            once: true,
            ..Self::new(callback)
        }
    }

    /// Create a new prepended listener.
    pub fn prepend(callback: ListenerFn<T>) -> Self {
        Self {
            prepend: true,
            ..Self::new(callback)
        }
    }

    /// Create a new prepended one-time listener.
    pub fn prepend_once(callback: ListenerFn<T>) -> Self {
        Self {
            once: true,
            prepend: true,
            ..Self::new(callback)
        }
    }
}

impl<T> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("once", &self.once)
            .field("prepend", &self.prepend)
            .finish_non_exhaustive()
    }
}

/// Listener table for one emitter.
pub struct EventEmitterState<T> {
    /// Listeners indexed by event name, in call order.
    listeners: HashMap<String, Vec<Listener<T>>>,

    /// Maximum listeners per event (0 = unlimited).
    max_listeners: usize,

    /// Total number of listeners across all events.
    listener_count: usize,

    /// Events that already produced a leak warning.
    warned: HashSet<String>,
}

impl<T> EventEmitterState<T> {
    /// Create a new event emitter state with default max listeners.
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            max_listeners: DEFAULT_MAX_LISTENERS,
            listener_count: 0,
            warned: HashSet::new(),
        }
    }

    /// Set the maximum number of listeners per event.
    pub fn set_max_listeners(&mut self, n: usize) {
        self.max_listeners = n;
    }

    /// Get the maximum number of listeners per event.
    pub fn get_max_listeners(&self) -> usize {
        self.max_listeners
    }

    /// Add a listener for an event. Returns the listener ID and whether
    /// a max listeners warning should be emitted.
    pub fn add_listener(&mut self, event: &str, listener: Listener<T>) -> (ListenerId, bool) {
        let id = listener.id;
        let prepend = listener.prepend;

        let listeners = self.listeners.entry(event.to_string()).or_default();

        if prepend {
            listeners.insert(0, listener);
        } else {
            listeners.push(listener);
        }

        self.listener_count += 1;

        let over_limit = self.max_listeners > 0 && listeners.len() > self.max_listeners;
        let should_warn = over_limit && self.warned.insert(event.to_string());

        (id, should_warn)
    }

    /// Remove a listener by ID. Returns true if the listener was found and removed.
    pub fn remove_listener(&mut self, event: &str, listener_id: ListenerId) -> bool {
        if let Some(listeners) = self.listeners.get_mut(event) {
            if let Some(pos) = listeners.iter().position(|l| l.id == listener_id) {
                listeners.remove(pos);
                self.listener_count -= 1;
                return true;
            }
        }
        false
    }

    /// Remove all listeners for an event, or all events if event is None.
    /// Returns the list of removed listener IDs.
    pub fn remove_all_listeners(&mut self, event: Option<&str>) -> Vec<ListenerId> {
        let mut removed = Vec::new();

        match event {
            Some(event_name) => {
                if let Some(listeners) = self.listeners.remove(event_name) {
                    for listener in listeners {
                        removed.push(listener.id);
                        self.listener_count -= 1;
                    }
                }
            }
            None => {
                for (_, listeners) in self.listeners.drain() {
                    removed.extend(listeners.into_iter().map(|l| l.id));
                }
                self.listener_count = 0;
            }
        }

        removed
    }

    /// Get listener IDs for an event in order they should be called.
    pub fn listeners(&self, event: &str) -> Vec<ListenerId> {
        self.listeners
            .get(event)
            .map(|l| l.iter().map(|listener| listener.id).collect())
            .unwrap_or_default()
    }

    /// Get the number of listeners for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|l| l.len()).unwrap_or(0)
    }

    /// Total number of listeners across all events.
    pub fn total_listener_count(&self) -> usize {
        self.listener_count
    }

    /// Get all event names that have listeners.
    pub fn event_names(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Snapshot the callbacks for `event` and drop its once-listeners.
    fn take_for_emit(&mut self, event: &str) -> Vec<ListenerFn<T>> {
        let Some(listeners) = self.listeners.get_mut(event) else {
            return Vec::new();
        };
        let callbacks: Vec<_> = listeners.iter().map(|l| l.callback.clone()).collect();
        let before = listeners.len();
        listeners.retain(|l| !l.once);
        self.listener_count -= before - listeners.len();
        callbacks
    }
}

impl<T> Default for EventEmitterState<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper around EventEmitterState.
///
/// Emission works on a snapshot: listeners added or removed while an event is
/// being dispatched take effect from the next `emit`. No lock is held while a
/// listener runs, so listeners may freely re-enter the emitter.
pub struct EventEmitter<T> {
    state: Arc<Mutex<EventEmitterState<T>>>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventEmitter")
            .field("events", &state.event_names())
            .field("listener_count", &state.listener_count)
            .finish()
    }
}

impl<T> EventEmitter<T> {
    /// Create a new EventEmitter.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EventEmitterState::new())),
        }
    }

    /// Set max listeners.
    pub fn set_max_listeners(&self, n: usize) {
        self.state.lock().set_max_listeners(n);
    }

    /// Get max listeners.
    pub fn get_max_listeners(&self) -> usize {
        self.state.lock().get_max_listeners()
    }

    /// Add a listener.
    pub fn add_listener(&self, event: &str, listener: Listener<T>) -> ListenerId {
        let (id, warn) = self.state.lock().add_listener(event, listener);
        if warn {
            tracing::warn!(
                event,
                "possible EventEmitter memory leak detected; use set_max_listeners() to increase limit"
            );
        }
        id
    }

    /// Register `f` for every emission of `event`.
    pub fn on<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add_listener(event, Listener::new(Arc::new(f)))
    }

    /// Register `f` for the next emission of `event` only.
    pub fn once<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add_listener(event, Listener::once(Arc::new(f)))
    }

    /// Register `f` ahead of every existing listener.
    pub fn prepend_listener<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add_listener(event, Listener::prepend(Arc::new(f)))
    }

    /// Register a one-time `f` ahead of every existing listener.
    pub fn prepend_once_listener<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add_listener(event, Listener::prepend_once(Arc::new(f)))
    }

    /// Remove a listener.
    pub fn remove_listener(&self, event: &str, listener_id: ListenerId) -> bool {
        self.state.lock().remove_listener(event, listener_id)
    }

    /// Alias for [`EventEmitter::remove_listener`].
    pub fn off(&self, event: &str, listener_id: ListenerId) -> bool {
        self.remove_listener(event, listener_id)
    }

    /// Remove all listeners.
    pub fn remove_all_listeners(&self, event: Option<&str>) -> Vec<ListenerId> {
        self.state.lock().remove_all_listeners(event)
    }

    /// Get listeners for an event.
    pub fn listeners(&self, event: &str) -> Vec<ListenerId> {
        self.state.lock().listeners(event)
    }

    /// Get listener count for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.state.lock().listener_count(event)
    }

    /// Get all event names.
    pub fn event_names(&self) -> Vec<String> {
        self.state.lock().event_names()
    }

    /// Call every listener of `event` with `arg`, in registration order.
    ///
    /// Returns `true` if the event had listeners.
    pub fn emit(&self, event: &str, arg: &T) -> bool {
        let callbacks = self.state.lock().take_for_emit(event);
        if callbacks.is_empty() {
            return false;
        }
        for callback in callbacks {
            callback(arg);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> ListenerFn<()> {
        Arc::new(|_| {})
    }

    #[test]
    fn test_listener_creation() {
        let listener = Listener::new(noop());
        assert!(!listener.once);
        assert!(!listener.prepend);

        let once_listener = Listener::once(noop());
        assert!(once_listener.once);
        assert!(!once_listener.prepend);

        let prepend_listener = Listener::prepend(noop());
        assert!(!prepend_listener.once);
        assert!(prepend_listener.prepend);
        assert_ne!(listener.id, prepend_listener.id);
    }

    #[test]
    fn test_add_and_remove_listeners() {
        let emitter: EventEmitter<()> = EventEmitter::new();

        let id1 = emitter.on("test", |_| {});
        let id2 = emitter.on("test", |_| {});

        assert_eq!(emitter.listener_count("test"), 2);
        assert_eq!(emitter.listeners("test"), vec![id1, id2]);

        assert!(emitter.off("test", id1));
        assert!(!emitter.off("test", id1));
        assert_eq!(emitter.listener_count("test"), 1);
        assert_eq!(emitter.listeners("test"), vec![id2]);
    }

    #[test]
    fn test_prepend_listener() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let id1 = emitter.on("test", move |_| o.lock().push("first"));
        let o = order.clone();
        let id2 = emitter.prepend_listener("test", move |_| o.lock().push("prepended"));

        assert_eq!(emitter.listeners("test"), vec![id2, id1]);
        emitter.emit("test", &());
        assert_eq!(*order.lock(), vec!["prepended", "first"]);
    }

    #[test]
    fn test_max_listeners_warning() {
        let mut state: EventEmitterState<()> = EventEmitterState::new();
        state.set_max_listeners(2);

        let (_, warn1) = state.add_listener("test", Listener::new(noop()));
        let (_, warn2) = state.add_listener("test", Listener::new(noop()));
        let (_, warn3) = state.add_listener("test", Listener::new(noop()));
        let (_, warn4) = state.add_listener("test", Listener::new(noop()));

        assert!(!warn1);
        assert!(!warn2);
        assert!(warn3);
        // Only warn once per event
        assert!(!warn4);
    }

    #[test]
    fn test_remove_all_listeners() {
        let emitter: EventEmitter<()> = EventEmitter::new();

        emitter.on("event1", |_| {});
        emitter.on("event1", |_| {});
        emitter.on("event2", |_| {});

        let removed = emitter.remove_all_listeners(Some("event1"));
        assert_eq!(removed.len(), 2);
        assert_eq!(emitter.listener_count("event1"), 0);
        assert_eq!(emitter.listener_count("event2"), 1);

        let removed = emitter.remove_all_listeners(None);
        assert_eq!(removed.len(), 1);
        assert_eq!(emitter.event_names().len(), 0);
    }

    #[test]
    fn test_once_listeners() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = total.clone();
        emitter.once("tick", move |n| {
            t.fetch_add(*n as usize, Ordering::SeqCst);
        });
        assert!(emitter.emit("tick", &5));
        assert!(!emitter.emit("tick", &5));
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert_eq!(emitter.listener_count("tick"), 0);
    }

    #[test]
    fn test_emit_without_listeners() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        assert!(!emitter.emit("nothing", &()));
    }

    #[test]
    fn test_listener_may_reenter_emitter() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner = emitter.clone();
        let h = hits.clone();
        emitter.once("outer", move |_| {
            let h2 = h.clone();
            inner.on("inner", move |_| {
                h2.fetch_add(1, Ordering::SeqCst);
            });
            inner.emit("inner", &());
            inner.emit("outer", &());
        });

        emitter.emit("outer", &());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_during_emit_applies_next_time() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let second_id = Arc::new(Mutex::new(None));
        let e = emitter.clone();
        let s = second_id.clone();
        emitter.on("test", move |_| {
            if let Some(id) = s.lock().take() {
                e.off("test", id);
            }
        });
        let h = hits.clone();
        let id = emitter.on("test", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        *second_id.lock() = Some(id);

        emitter.emit("test", &());
        emitter.emit("test", &());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
