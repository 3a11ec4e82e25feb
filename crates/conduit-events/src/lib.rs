//! Event plumbing shared by Conduit streams: a listener-id based
//! [`EventEmitter`] and the [`AbortController`] / [`AbortSignal`] pair used
//! for cancellation.

pub mod abort;
pub mod emitter;

pub use abort::{AbortController, AbortReason, AbortSignal, AbortedError};
pub use emitter::{
    DEFAULT_MAX_LISTENERS, EventEmitter, EventEmitterState, Listener, ListenerFn, ListenerId,
};
