//! Stream capability model.
//!
//! Classifies stream-like objects by what they expose rather than by their
//! concrete type, so objects from unrelated implementations (sockets, HTTP
//! messages, test doubles) interoperate with `eos`, `pipeline` and the
//! destroy machine. Every predicate is side-effect free and answers `None`
//! ("unknown") or `false` for shapes it does not recognise.

use crate::error::StreamError;
use crate::events::StreamEvents;
use crate::state::{ReadableView, WritableView};
use std::sync::Arc;

/// Methods an object exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub pipe: bool,
    pub write: bool,
    pub pause_resume: bool,
    pub destroy: bool,
    pub close: bool,
}

/// Objects exposing `set_header` and `abort` (outgoing HTTP requests).
pub trait RequestLike: Send + Sync {
    fn set_header(&self, name: &str, value: &str);
    fn abort(&self);
}

/// Anything that can take part in stream lifecycles.
///
/// Only [`StreamLike::events`] is required; every other probe defaults to
/// "absent".
pub trait StreamLike: Send + Sync {
    fn events(&self) -> &StreamEvents;

    /// Snapshot of the readable state blob.
    fn readable_state(&self) -> Option<ReadableView> {
        None
    }

    /// Snapshot of the writable state blob.
    fn writable_state(&self) -> Option<WritableView> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Public `readable` flag.
    fn readable(&self) -> Option<bool> {
        None
    }

    /// Public `writable` flag.
    fn writable(&self) -> Option<bool> {
        None
    }

    /// Public `destroyed` flag.
    fn destroyed(&self) -> Option<bool> {
        None
    }

    /// Public `closed` flag.
    fn closed(&self) -> Option<bool> {
        None
    }

    /// Public `aborted` flag (incoming HTTP messages).
    fn aborted(&self) -> Option<bool> {
        None
    }

    /// Whether an object without state blobs will emit `close` by itself.
    fn will_emit_close_hint(&self) -> Option<bool> {
        None
    }

    fn as_request(&self) -> Option<&dyn RequestLike> {
        None
    }

    /// The request this object responds to (`res.req`).
    fn request(&self) -> Option<Arc<dyn StreamLike>> {
        None
    }

    /// Tear down. Only called when `capabilities().destroy` is set.
    fn destroy(&self, _err: Option<StreamError>) {}

    /// Close. Only called when `capabilities().close` is set.
    fn close(&self) {}
}

impl<T: StreamLike + ?Sized> StreamLike for Arc<T> {
    fn events(&self) -> &StreamEvents {
        (**self).events()
    }
    fn readable_state(&self) -> Option<ReadableView> {
        (**self).readable_state()
    }
    fn writable_state(&self) -> Option<WritableView> {
        (**self).writable_state()
    }
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
    fn readable(&self) -> Option<bool> {
        (**self).readable()
    }
    fn writable(&self) -> Option<bool> {
        (**self).writable()
    }
    fn destroyed(&self) -> Option<bool> {
        (**self).destroyed()
    }
    fn closed(&self) -> Option<bool> {
        (**self).closed()
    }
    fn aborted(&self) -> Option<bool> {
        (**self).aborted()
    }
    fn will_emit_close_hint(&self) -> Option<bool> {
        (**self).will_emit_close_hint()
    }
    fn as_request(&self) -> Option<&dyn RequestLike> {
        (**self).as_request()
    }
    fn request(&self) -> Option<Arc<dyn StreamLike>> {
        (**self).request()
    }
    fn destroy(&self, err: Option<StreamError>) {
        (**self).destroy(err)
    }
    fn close(&self) {
        (**self).close()
    }
}

pub fn is_readable_node_stream<S: StreamLike + ?Sized>(stream: &S, strict: bool) -> bool {
    let caps = stream.capabilities();
    if !caps.pipe || (strict && !caps.pause_resume) {
        return false;
    }
    // A duplex counts as readable only while its readable side is enabled.
    match stream.writable_state() {
        Some(_) => stream.readable_state().is_some_and(|r| r.readable),
        None => true,
    }
}

pub fn is_writable_node_stream<S: StreamLike + ?Sized>(stream: &S) -> bool {
    if !stream.capabilities().write {
        return false;
    }
    stream.readable_state().is_none() || stream.writable_state().is_none_or(|w| w.writable)
}

pub fn is_duplex_node_stream<S: StreamLike + ?Sized>(stream: &S) -> bool {
    let caps = stream.capabilities();
    caps.pipe && caps.write && stream.readable_state().is_some()
}

pub fn is_node_stream<S: StreamLike + ?Sized>(stream: &S) -> bool {
    let caps = stream.capabilities();
    stream.readable_state().is_some()
        || stream.writable_state().is_some()
        || caps.write
        || caps.pipe
}

pub fn is_request<S: StreamLike + ?Sized>(stream: &S) -> bool {
    stream.as_request().is_some()
}

fn lifecycle_destroyed<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    stream
        .writable_state()
        .map(|w| w.lifecycle.destroyed)
        .or_else(|| stream.readable_state().map(|r| r.lifecycle.destroyed))
}

pub fn is_destroyed<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    if !is_node_stream(stream) {
        return None;
    }
    Some(
        stream.destroyed() == Some(true)
            || stream.events().is_marked_destroyed()
            || lifecycle_destroyed(stream) == Some(true),
    )
}

pub fn is_writable_ended<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    if !is_writable_node_stream(stream) {
        return None;
    }
    let w = stream.writable_state()?;
    if w.ended {
        return Some(true);
    }
    if w.lifecycle.errored.is_some() {
        return Some(false);
    }
    Some(w.ended)
}

/// `strict == false` also counts an ended writable with nothing buffered.
pub fn is_writable_finished<S: StreamLike + ?Sized>(stream: &S, strict: bool) -> Option<bool> {
    if !is_writable_node_stream(stream) {
        return None;
    }
    let w = stream.writable_state()?;
    if w.finished {
        return Some(true);
    }
    if w.lifecycle.errored.is_some() {
        return Some(false);
    }
    Some(!strict && w.ended && w.length == 0)
}

pub fn is_readable_ended<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    if !is_readable_node_stream(stream, false) {
        return None;
    }
    let r = stream.readable_state()?;
    if r.lifecycle.errored.is_some() {
        return Some(false);
    }
    Some(r.ended)
}

/// `strict == false` also counts an ended readable with an empty buffer.
pub fn is_readable_finished<S: StreamLike + ?Sized>(stream: &S, strict: bool) -> Option<bool> {
    if !is_readable_node_stream(stream, false) {
        return None;
    }
    let r = stream.readable_state()?;
    if r.lifecycle.errored.is_some() {
        return Some(false);
    }
    Some(r.end_emitted || (!strict && r.ended && r.length == 0))
}

pub fn is_readable<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    let readable = stream.readable()?;
    if is_destroyed(stream) == Some(true) {
        return Some(false);
    }
    Some(
        is_readable_node_stream(stream, false)
            && readable
            && is_readable_finished(stream, true) != Some(true),
    )
}

pub fn is_writable<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    let writable = stream.writable()?;
    if is_destroyed(stream) == Some(true) {
        return Some(false);
    }
    Some(is_writable_node_stream(stream) && writable && is_writable_ended(stream) != Some(true))
}

/// Which directions [`is_finished`] considers.
#[derive(Debug, Clone, Copy)]
pub struct FinishedOptions {
    pub readable: bool,
    pub writable: bool,
}

impl Default for FinishedOptions {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
        }
    }
}

pub fn is_finished<S: StreamLike + ?Sized>(stream: &S, opts: FinishedOptions) -> Option<bool> {
    if !is_node_stream(stream) {
        return None;
    }
    if is_destroyed(stream) == Some(true) {
        return Some(true);
    }
    if opts.readable && is_readable(stream) == Some(true) {
        return Some(false);
    }
    if opts.writable && is_writable(stream) == Some(true) {
        return Some(false);
    }
    Some(true)
}

pub fn is_writable_errored<S: StreamLike + ?Sized>(stream: &S) -> Option<StreamError> {
    if !is_node_stream(stream) {
        return None;
    }
    stream.writable_state().and_then(|w| w.lifecycle.errored)
}

pub fn is_readable_errored<S: StreamLike + ?Sized>(stream: &S) -> Option<StreamError> {
    if !is_node_stream(stream) {
        return None;
    }
    stream.readable_state().and_then(|r| r.lifecycle.errored)
}

pub fn is_errored<S: StreamLike + ?Sized>(stream: &S) -> bool {
    is_writable_errored(stream).is_some() || is_readable_errored(stream).is_some()
}

pub fn is_closed<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    if !is_node_stream(stream) {
        return None;
    }
    if let Some(closed) = stream.closed() {
        return Some(closed);
    }
    let w = stream.writable_state().map(|w| w.lifecycle.closed);
    let r = stream.readable_state().map(|r| r.lifecycle.closed);
    match (w, r) {
        (None, None) => None,
        (w, r) => Some(w.unwrap_or(false) || r.unwrap_or(false)),
    }
}

/// Predict whether the object will eventually emit `close` on its own.
pub fn will_emit_close<S: StreamLike + ?Sized>(stream: &S) -> Option<bool> {
    if !is_node_stream(stream) {
        return None;
    }
    let lifecycle = stream
        .writable_state()
        .map(|w| w.lifecycle)
        .or_else(|| stream.readable_state().map(|r| r.lifecycle));
    Some(match lifecycle {
        Some(l) => l.auto_destroy && l.emit_close && !l.closed,
        None => stream.will_emit_close_hint() == Some(true),
    })
}
