//! End-of-stream waiter.
//!
//! [`eos`] calls back exactly once when the directions of a stream it was
//! asked to watch reach a terminal outcome: `end`/`finish`, an error, a
//! premature `close`, or an abort of the supplied signal. The listeners it
//! attaches are removed as soon as it fires, or earlier through
//! [`Cleanup::run`].

use crate::capability::{
    StreamLike, is_closed, is_node_stream, is_readable, is_readable_errored,
    is_readable_finished, is_readable_node_stream, is_request, is_writable, is_writable_errored,
    is_writable_finished, is_writable_node_stream, will_emit_close,
};
use crate::error::{StreamError, StreamResult};
use crate::events::EventArg;
use crate::stream::Callback;
use conduit_events::{AbortReason, AbortSignal, ListenerId};
use conduit_runtime::next_tick;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Options for [`eos`] and [`finished`].
#[derive(Debug, Clone)]
pub struct EosOptions {
    /// Wait for the readable side; `None` derives it from the stream.
    pub readable: Option<bool>,
    /// Wait for the writable side; `None` derives it from the stream.
    pub writable: Option<bool>,
    /// Complete on `error` events (default `true`).
    pub error: bool,
    pub signal: Option<AbortSignal>,
}

impl Default for EosOptions {
    fn default() -> Self {
        Self {
            readable: None,
            writable: None,
            error: true,
            signal: None,
        }
    }
}

impl EosOptions {
    pub fn readable(mut self, on: bool) -> Self {
        self.readable = Some(on);
        self
    }

    pub fn writable(mut self, on: bool) -> Self {
        self.writable = Some(on);
        self
    }

    pub fn error(mut self, on: bool) -> Self {
        self.error = on;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Finish,
    End,
    Error,
    Close,
    LegacyFinish,
    Request,
}

struct Flags {
    will_emit_close: bool,
    readable_finished: bool,
    writable_finished: bool,
}

struct Attached {
    target: Arc<dyn StreamLike>,
    event: &'static str,
    id: ListenerId,
}

struct Registration {
    stream: Arc<dyn StreamLike>,
    readable: bool,
    writable: bool,
    callback: Mutex<Option<Callback>>,
    flags: Mutex<Flags>,
    listeners: Mutex<Vec<Attached>>,
    signal: Mutex<Option<(AbortSignal, ListenerId)>>,
}

impl Registration {
    fn listen(self: &Arc<Self>, target: &Arc<dyn StreamLike>, event: &'static str, h: Handler) {
        let reg = self.clone();
        let id = target.events().on(event, move |arg| reg.handle(h, arg));
        self.listeners.lock().push(Attached {
            target: target.clone(),
            event,
            id,
        });
    }

    fn handle(self: &Arc<Self>, h: Handler, arg: &EventArg) {
        match h {
            Handler::Finish => self.on_finish(),
            Handler::End => self.on_end(),
            Handler::Error => {
                let err = arg
                    .error()
                    .cloned()
                    .unwrap_or_else(|| StreamError::msg("unknown error"));
                self.fire(Some(err));
            }
            Handler::Close => self.on_close(),
            Handler::LegacyFinish => {
                if self.stream.writable() != Some(true) {
                    self.on_finish();
                }
            }
            Handler::Request => self.on_request(),
        }
    }

    fn on_finish(self: &Arc<Self>) {
        let destroyed = self.stream.destroyed() == Some(true);
        let readable_open = self.stream.readable() == Some(true);
        let fire = {
            let mut f = self.flags.lock();
            f.writable_finished = true;
            if destroyed {
                f.will_emit_close = false;
            }
            if f.will_emit_close && (!readable_open || self.readable) {
                return;
            }
            !self.readable || f.readable_finished
        };
        if fire {
            self.fire(None);
        }
    }

    fn on_end(self: &Arc<Self>) {
        let destroyed = self.stream.destroyed() == Some(true);
        let writable_open = self.stream.writable() == Some(true);
        let fire = {
            let mut f = self.flags.lock();
            f.readable_finished = true;
            if destroyed {
                f.will_emit_close = false;
            }
            if f.will_emit_close && (!writable_open || self.writable) {
                return;
            }
            !self.writable || f.writable_finished
        };
        if fire {
            self.fire(None);
        }
    }

    fn errored(&self) -> Option<StreamError> {
        is_writable_errored(&self.stream).or_else(|| is_readable_errored(&self.stream))
    }

    fn on_close(self: &Arc<Self>) {
        let (readable_finished, writable_finished) = {
            let f = self.flags.lock();
            (f.readable_finished, f.writable_finished)
        };
        if let Some(err) = self.errored() {
            self.fire(Some(err));
            return;
        }
        let s = &self.stream;
        if self.readable
            && !readable_finished
            && is_readable_node_stream(s, true)
            && is_readable_finished(s, false) != Some(true)
        {
            self.fire(Some(StreamError::PrematureClose));
            return;
        }
        if self.writable && !writable_finished && is_writable_finished(s, false) != Some(true) {
            self.fire(Some(StreamError::PrematureClose));
            return;
        }
        self.fire(None);
    }

    /// Terminal state observed at registration time.
    fn on_closed(self: &Arc<Self>) {
        let err = self.errored();
        self.fire(err);
    }

    fn on_request(self: &Arc<Self>) {
        if let Some(req) = self.stream.request() {
            self.listen(&req, "finish", Handler::Finish);
        }
    }

    fn on_abort(self: &Arc<Self>, reason: Option<AbortReason>) {
        tracing::trace!("eos aborted by signal");
        self.fire(Some(StreamError::aborted(reason)));
    }

    fn fire(self: &Arc<Self>, err: Option<StreamError>) {
        let cb = self.callback.lock().take();
        if let Some(cb) = cb {
            self.detach();
            cb(err);
        }
    }

    fn detach(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for l in listeners {
            l.target.events().off(l.event, l.id);
        }
        let signal = self.signal.lock().take();
        if let Some((signal, id)) = signal {
            signal.remove_listener(id);
        }
    }
}

/// Handle returned by [`eos`]: detaches the registration.
#[derive(Clone)]
pub struct Cleanup(Arc<Registration>);

impl Cleanup {
    /// Remove every listener and drop the callback without calling it.
    /// Idempotent.
    pub fn run(&self) {
        self.0.callback.lock().take();
        self.0.detach();
    }

    /// Whether the callback already fired or was cleaned up.
    pub fn is_done(&self) -> bool {
        self.0.callback.lock().is_none()
    }
}

/// Call `callback` once the watched directions of `stream` are done.
///
/// Returns `Err` without attaching anything when `stream` is not
/// stream-like.
pub fn eos<S, F>(stream: &S, opts: EosOptions, callback: F) -> StreamResult<Cleanup>
where
    S: StreamLike + Clone + 'static,
    F: FnOnce(Option<StreamError>) + Send + 'static,
{
    if !is_node_stream(stream) {
        return Err(StreamError::InvalidArgType {
            name: "stream".into(),
            expected: "an instance of Stream",
        });
    }
    let s: Arc<dyn StreamLike> = Arc::new(stream.clone());

    let readable = opts.readable.unwrap_or_else(|| is_readable_node_stream(&s, false));
    let writable = opts.writable.unwrap_or_else(|| is_writable_node_stream(&s));
    let will_emit_close = will_emit_close(&s) == Some(true)
        && is_readable_node_stream(&s, false) == readable
        && is_writable_node_stream(&s) == writable;
    let writable_finished = is_writable_finished(&s, false) == Some(true);
    let readable_finished = is_readable_finished(&s, false) == Some(true);
    let closed = is_closed(&s) == Some(true);

    let reg = Arc::new(Registration {
        stream: s.clone(),
        readable,
        writable,
        callback: Mutex::new(Some(Box::new(callback))),
        flags: Mutex::new(Flags {
            will_emit_close,
            readable_finished,
            writable_finished,
        }),
        listeners: Mutex::new(Vec::new()),
        signal: Mutex::new(None),
    });

    if is_request(&s) {
        reg.listen(&s, "complete", Handler::Finish);
        if !will_emit_close {
            reg.listen(&s, "abort", Handler::Close);
        }
        if s.request().is_some() {
            reg.on_request();
        } else {
            reg.listen(&s, "request", Handler::Request);
        }
    } else if writable && s.writable_state().is_none() {
        reg.listen(&s, "end", Handler::LegacyFinish);
        reg.listen(&s, "close", Handler::LegacyFinish);
    }

    if !will_emit_close && s.aborted().is_some() {
        reg.listen(&s, "aborted", Handler::Close);
    }

    reg.listen(&s, "end", Handler::End);
    reg.listen(&s, "finish", Handler::Finish);
    if opts.error {
        reg.listen(&s, "error", Handler::Error);
    }
    reg.listen(&s, "close", Handler::Close);

    let error_emitted = s.writable_state().is_some_and(|w| w.lifecycle.error_emitted)
        || s.readable_state().is_some_and(|r| r.lifecycle.error_emitted);
    // Terminal state already reached: report it on the next tick.
    let already_done = !closed
        && if error_emitted {
            !will_emit_close
        } else {
            (!readable
                && (!will_emit_close || is_readable(&s) == Some(true))
                && (writable_finished || is_writable(&s) == Some(false)))
                || (!writable
                    && (!will_emit_close || is_writable(&s) == Some(true))
                    && (readable_finished || is_readable(&s) == Some(false)))
                || (s.readable_state().is_some()
                    && s.request().is_some()
                    && s.aborted() == Some(true))
        };
    if closed {
        let reg = reg.clone();
        next_tick(move || reg.on_close());
    } else if already_done {
        let reg = reg.clone();
        next_tick(move || reg.on_closed());
    }

    if let Some(signal) = opts.signal.filter(|_| !closed) {
        if signal.aborted() {
            let reg = reg.clone();
            next_tick(move || reg.on_abort(signal.reason()));
        } else {
            let r = reg.clone();
            let id = signal.on_abort(move |reason| r.on_abort(Some(reason.clone())));
            *reg.signal.lock() = Some((signal, id));
        }
    }

    Ok(Cleanup(reg))
}

/// Future form of [`eos`]. The registration happens before this returns,
/// so events emitted before the future is first polled are not missed.
pub fn finished<S>(
    stream: &S,
    opts: EosOptions,
) -> impl Future<Output = StreamResult<()>> + Send + 'static
where
    S: StreamLike + Clone + 'static,
{
    let (tx, rx) = oneshot::channel();
    let registered = eos(stream, opts, move |err| {
        let _ = tx.send(match err {
            Some(err) => Err(err),
            None => Ok(()),
        });
    })
    .map(drop);

    async move {
        if let Err(err) = registered {
            return Err(err);
        }
        rx.await.unwrap_or(Err(StreamError::PrematureClose))
    }
}
