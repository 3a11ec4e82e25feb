//! Event surface shared by every stream-like object.

use crate::chunk::Chunk;
use crate::error::StreamError;
use conduit_events::{EventEmitter, ListenerId};
use std::sync::atomic::{AtomicBool, Ordering};

/// Payload delivered to stream event listeners.
#[derive(Debug, Clone)]
pub enum EventArg {
    /// Events without a payload (`end`, `finish`, `close`, `drain`, ...)
    None,
    /// `data`
    Chunk(Chunk),
    /// `error`
    Error(StreamError),
    /// `pipe` / `unpipe`: id of the other stream
    Stream(u64),
}

impl EventArg {
    pub fn chunk(&self) -> Option<&Chunk> {
        match self {
            EventArg::Chunk(c) => Some(c),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StreamError> {
        match self {
            EventArg::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn stream_id(&self) -> Option<u64> {
        match self {
            EventArg::Stream(id) => Some(*id),
            _ => None,
        }
    }
}

/// Emitter plus the side-table bits kept for any stream-like object,
/// whether or not it has state blobs of its own.
#[derive(Debug, Default)]
pub struct StreamEvents {
    emitter: EventEmitter<EventArg>,
    destroyed: AtomicBool,
}

impl StreamEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitter(&self) -> &EventEmitter<EventArg> {
        &self.emitter
    }

    pub fn on<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventArg) + Send + Sync + 'static,
    {
        self.emitter.on(event, f)
    }

    pub fn once<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventArg) + Send + Sync + 'static,
    {
        self.emitter.once(event, f)
    }

    pub fn prepend_listener<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventArg) + Send + Sync + 'static,
    {
        self.emitter.prepend_listener(event, f)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.emitter.off(event, id)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.emitter.listener_count(event)
    }

    /// Emit `event`. An `error` nobody listens to is logged.
    pub fn emit(&self, event: &str, arg: EventArg) -> bool {
        let handled = self.emitter.emit(event, &arg);
        if !handled && event == "error" {
            if let EventArg::Error(err) = &arg {
                tracing::warn!(error = %err, code = err.code(), "unhandled stream 'error' event");
            }
        }
        handled
    }

    /// Mark the object as torn down by [`crate::destroy::destroyer`].
    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_marked_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn clear_destroyed_mark(&self) {
        self.destroyed.store(false, Ordering::Release);
    }
}
