//! Destroy/construct state machine.
//!
//! Construction runs the `construct` hook on a later tick, at most once per
//! stream. Destruction is idempotent: the `destroy` hook runs once, every
//! `destroy` callback receives the same outcome, and `error`/`close` are
//! always emitted on a later tick than the call that caused them.

use crate::capability::{FinishedOptions, StreamLike, is_destroyed, is_finished};
use crate::error::{StreamError, aggregate_two_errors};
use crate::events::EventArg;
use crate::once::Once;
use crate::stream::{Callback, Stream};
use crate::writable;
use conduit_runtime::next_tick;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Tear `stream` down.
///
/// The first call records `err`, marks both directions destroyed and runs
/// the destroy hook (after construction, if that is still pending). Later
/// calls only register `cb`, which receives the first call's outcome.
pub fn destroy(stream: &Stream, err: Option<StreamError>, cb: Option<Callback>) {
    if stream.any_lifecycle(|l| l.destroyed) {
        if let Some(cb) = cb {
            let mut slots = stream.slots();
            match slots.destroy_outcome.clone() {
                Some(outcome) => {
                    drop(slots);
                    cb(outcome);
                }
                None => slots.destroy_waiters.push(cb),
            }
        }
        return;
    }

    tracing::trace!(stream = stream.id(), error = ?err, "destroying stream");
    writable::schedule_error_buffer(stream);

    if let Some(err) = &err {
        stream.each_lifecycle(|l| l.record_error(err));
    }
    stream.each_lifecycle(|l| l.destroyed = true);

    if stream.any_lifecycle(|l| !l.constructed) {
        stream.slots().destroy_deferred = Some((err, cb));
    } else {
        run_destroy(stream, err, cb);
    }
}

fn run_destroy(stream: &Stream, err: Option<StreamError>, cb: Option<Callback>) {
    let done = {
        let s = stream.clone();
        Arc::new(Once::new(move |err: Option<StreamError>| {
            on_destroy(&s, err, cb)
        }))
    };

    let result = match stream.hooks().destroy.clone() {
        Some(hook) => {
            let d = done.clone();
            hook(stream, err, Box::new(move |err| {
                d.call(err);
            }))
        }
        None => {
            done.call(err);
            Ok(())
        }
    };
    if let Err(err) = result {
        done.call(Some(err));
    }
}

fn on_destroy(stream: &Stream, err: Option<StreamError>, cb: Option<Callback>) {
    if let Some(err) = &err {
        stream.each_lifecycle(|l| l.record_error(err));
    }
    stream.each_lifecycle(|l| l.closed = true);

    let waiters = {
        let mut slots = stream.slots();
        slots.destroy_outcome = Some(err.clone());
        std::mem::take(&mut slots.destroy_waiters)
    };
    if let Some(cb) = cb {
        cb(err.clone());
    }
    for waiter in waiters {
        waiter(err.clone());
    }

    let s = stream.clone();
    match err {
        Some(err) => next_tick(move || {
            emit_error(&s, err);
            emit_close(&s);
        }),
        None => next_tick(move || emit_close(&s)),
    }
}

fn emit_error(stream: &Stream, err: StreamError) {
    if stream.any_lifecycle(|l| l.error_emitted) {
        return;
    }
    stream.each_lifecycle(|l| l.error_emitted = true);
    tracing::trace!(stream = stream.id(), error = %err, "emitting error");
    stream.emit("error", EventArg::Error(err));
}

fn emit_close(stream: &Stream) {
    stream.each_lifecycle(|l| l.close_emitted = true);
    if stream.any_lifecycle(|l| l.emit_close) {
        tracing::trace!(stream = stream.id(), "emitting close");
        stream.emit("close", EventArg::None);
    }
}

/// Route `err` into a full teardown when the stream auto-destroys, or just
/// record it and emit `error` on the next tick otherwise.
pub fn error_or_destroy(stream: &Stream, err: StreamError) {
    if stream.any_lifecycle(|l| l.destroyed) {
        return;
    }
    if stream.any_lifecycle(|l| l.auto_destroy) {
        destroy(stream, Some(err), None);
        return;
    }

    stream.each_lifecycle(|l| l.record_error(&err));
    let s = stream.clone();
    next_tick(move || emit_error(&s, err));
}

/// Run the stream's construct hook on a later tick, then `on_constructed`.
///
/// A no-op for streams without a construct hook. The hook runs at most
/// once however many times (or directions) this is called for.
pub fn construct<F>(stream: &Stream, on_constructed: F)
where
    F: FnOnce() + Send + 'static,
{
    if stream.hooks().construct.is_none() {
        return;
    }

    let schedule = {
        let mut slots = stream.slots();
        if slots.construct_done {
            drop(slots);
            next_tick(on_constructed);
            return;
        }
        slots.construct_waiters.push(Box::new(on_constructed));
        !std::mem::replace(&mut slots.construct_scheduled, true)
    };
    stream.each_lifecycle(|l| l.constructed = false);

    if schedule {
        tracing::trace!(stream = stream.id(), "construct scheduled");
        let s = stream.clone();
        next_tick(move || construct_now(&s));
    }
}

fn construct_now(stream: &Stream) {
    let Some(hook) = stream.hooks().construct.clone() else {
        return;
    };

    let called = Arc::new(AtomicBool::new(false));
    let complete: Arc<dyn Fn(Option<StreamError>) + Send + Sync> = {
        let s = stream.clone();
        Arc::new(move |err| {
            let s = s.clone();
            let called = called.clone();
            next_tick(move || on_construct(&s, &called, err));
        })
    };

    let c = complete.clone();
    if let Err(err) = hook(stream, Box::new(move |err| c(err))) {
        complete(Some(err));
    }
}

fn on_construct(stream: &Stream, called: &AtomicBool, err: Option<StreamError>) {
    if called.swap(true, Ordering::AcqRel) {
        error_or_destroy(stream, err.unwrap_or(StreamError::MultipleCallback));
        return;
    }

    stream.each_lifecycle(|l| l.constructed = true);
    let (deferred, waiters) = {
        let mut slots = stream.slots();
        slots.construct_done = true;
        (
            slots.destroy_deferred.take(),
            std::mem::take(&mut slots.construct_waiters),
        )
    };
    tracing::trace!(stream = stream.id(), error = ?err, "constructed");

    if stream.any_lifecycle(|l| l.destroyed) {
        if let Some((destroy_err, cb)) = deferred {
            run_destroy(stream, aggregate_two_errors(destroy_err, err), cb);
        }
    } else if let Some(err) = err {
        error_or_destroy(stream, err);
    } else {
        next_tick(move || {
            for waiter in waiters {
                waiter();
            }
        });
    }
}

/// Reset the lifecycle so a destroyed stream can be reused.
pub fn undestroy(stream: &Stream) {
    if let Some(mut r) = stream.rstate() {
        let l = &mut r.lifecycle;
        l.constructed = true;
        l.closed = false;
        l.close_emitted = false;
        l.destroyed = false;
        l.errored = None;
        l.error_emitted = false;
        r.reading = false;
        r.ended = !r.readable;
        r.end_emitted = !r.readable;
    }
    if let Some(mut w) = stream.wstate() {
        let l = &mut w.lifecycle;
        l.constructed = true;
        l.destroyed = false;
        l.closed = false;
        l.close_emitted = false;
        l.errored = None;
        l.error_emitted = false;
        w.final_called = false;
        w.prefinished = false;
        w.ended = !w.writable;
        w.ending = !w.writable;
        w.finished = !w.writable;
    }
    {
        let mut slots = stream.slots();
        slots.destroy_outcome = None;
        slots.destroy_deferred = None;
    }
    stream.events().clear_destroyed_mark();
}

/// Tear down any stream-like object with the best action it offers.
///
/// Request-like objects are aborted, objects with `destroy` are destroyed,
/// objects with only `close` are closed; anything else gets an `error` (or
/// `close`) event on the next tick. The object is marked destroyed either
/// way so it is never torn down twice.
pub fn destroyer<S>(stream: &S, err: Option<StreamError>)
where
    S: StreamLike + Clone + 'static,
{
    if is_destroyed(stream) == Some(true) {
        return;
    }
    let err = match err {
        None if is_finished(stream, FinishedOptions::default()) != Some(true) => {
            Some(StreamError::aborted(None))
        }
        err => err,
    };

    let caps = stream.capabilities();
    let parent = stream.request();
    if let Some(req) = stream.as_request() {
        req.abort();
    } else if let Some(req) = parent.as_ref().and_then(|r| r.as_request()) {
        req.abort();
    } else if caps.destroy {
        stream.destroy(err);
    } else if caps.close {
        stream.close();
    } else {
        let s = stream.clone();
        match err {
            Some(err) => next_tick(move || {
                s.events().emit("error", EventArg::Error(err));
            }),
            None => next_tick(move || {
                s.events().emit("close", EventArg::None);
            }),
        }
    }

    if stream.destroyed() != Some(true) {
        stream.events().mark_destroyed();
    }
}
