//! Tie a stream's lifetime to an [`AbortSignal`].

use crate::capability::{StreamLike, is_node_stream};
use crate::eos::{EosOptions, eos};
use crate::error::{StreamError, StreamResult};
use conduit_events::AbortSignal;

/// Destroy `stream` with an abort error once `signal` fires.
///
/// An already-aborted signal destroys the stream right away. The abort
/// listener is removed when the stream finishes first.
pub fn add_abort_signal<S>(signal: &AbortSignal, stream: &S) -> StreamResult<S>
where
    S: StreamLike + Clone + 'static,
{
    if !is_node_stream(stream) {
        return Err(StreamError::InvalidArgType {
            name: "stream".into(),
            expected: "an instance of Stream",
        });
    }

    if signal.aborted() {
        stream.destroy(Some(StreamError::aborted(signal.reason())));
        return Ok(stream.clone());
    }

    let target = stream.clone();
    let s = signal.clone();
    let id = signal.on_abort(move |reason| {
        tracing::trace!("abort signal destroying stream");
        target.destroy(Some(StreamError::aborted(Some(reason.clone()))));
    });
    eos(stream, EosOptions::default(), move |_| {
        s.remove_listener(id);
    })?;
    Ok(stream.clone())
}
