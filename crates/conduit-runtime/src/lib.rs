//! Conduit runtime: the deferred-execution primitive streams rely on.
//!
//! Stream code never emits a terminal event from inside the call that
//! decided to terminate; it hops through [`next_tick`] first. Tests and
//! hosts drive the queued work with [`run_until_idle`] or [`block_on`].

pub mod event_loop;
pub mod microtask;

pub use event_loop::{EventLoop, block_on, next_tick, queue_microtask, run_until_idle};
pub use microtask::{Microtask, MicrotaskQueue};
