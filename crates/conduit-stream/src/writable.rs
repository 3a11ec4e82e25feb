//! Writable side: buffering, backpressure, `final`/`prefinish`/`finish`.

use crate::chunk::Chunk;
use crate::destroy::error_or_destroy;
use crate::error::StreamError;
use crate::events::EventArg;
use crate::once::Once;
use crate::state::PendingWrite;
use crate::stream::{Callback, Stream};
use conduit_runtime::next_tick;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn noop() -> Callback {
    Box::new(|_| {})
}

/// Accept a chunk. `Err` means the write was rejected; the error has already
/// been delivered to `cb` and routed through `error_or_destroy`.
pub(crate) fn write(
    stream: &Stream,
    chunk: Chunk,
    cb: Option<Callback>,
) -> Result<bool, StreamError> {
    let cb = cb.unwrap_or_else(noop);
    let rejected = match stream.wstate() {
        None => Some(StreamError::NotImplemented("write")),
        Some(w) if !w.object_mode && matches!(chunk, Chunk::Json(_)) => {
            Some(StreamError::InvalidArgType {
                name: "chunk".into(),
                expected: "of type string or an instance of Bytes",
            })
        }
        Some(w) if w.ending => Some(StreamError::WriteAfterEnd),
        Some(w) if w.lifecycle.destroyed => Some(StreamError::Destroyed("write")),
        Some(_) => None,
    };

    if let Some(err) = rejected {
        let e = err.clone();
        next_tick(move || cb(Some(e)));
        if stream.has_writable() {
            error_or_destroy(stream, err.clone());
        }
        return Err(err);
    }

    if let Some(mut w) = stream.wstate() {
        w.pending_cb += 1;
    }
    Ok(write_or_buffer(stream, chunk, cb))
}

fn write_or_buffer(stream: &Stream, chunk: Chunk, cb: Callback) -> bool {
    let (ret, direct) = {
        let Some(mut w) = stream.wstate() else {
            return false;
        };
        let len = chunk.buffered_len(w.object_mode);
        w.length += len;
        let ret = w.length < w.high_water_mark;
        if !ret {
            w.need_drain = true;
        }

        if w.writing
            || w.corked > 0
            || w.lifecycle.errored.is_some()
            || !w.lifecycle.constructed
        {
            w.buffered.push_back(PendingWrite {
                chunk,
                callback: cb,
            });
            (ret, None)
        } else {
            w.write_len = len;
            w.write_cb = Some(cb);
            w.writing = true;
            w.sync = true;
            (ret, Some(chunk))
        }
    };

    if let Some(chunk) = direct {
        call_write_hook(stream, chunk);
        if let Some(mut w) = stream.wstate() {
            w.sync = false;
        }
    }

    stream
        .wstate()
        .is_some_and(|w| ret && w.lifecycle.errored.is_none() && !w.lifecycle.destroyed)
}

fn call_write_hook(stream: &Stream, chunk: Chunk) {
    let done = {
        let s = stream.clone();
        Arc::new(Once::new(move |err| on_write(&s, err)))
    };

    if stream.any_lifecycle(|l| l.destroyed) {
        done.call(Some(StreamError::Destroyed("write")));
        return;
    }

    let result = match stream.hooks().write.clone() {
        Some(hook) => {
            let d = done.clone();
            hook(stream, chunk, Box::new(move |err| {
                d.call(err);
            }))
        }
        None => Err(StreamError::NotImplemented("_write")),
    };
    if let Err(err) = result {
        if !done.call(Some(err.clone())) {
            error_or_destroy(stream, err);
        }
    }
}

fn on_write(stream: &Stream, err: Option<StreamError>) {
    let (sync, cb) = {
        let Some(mut w) = stream.wstate() else {
            return;
        };
        let Some(cb) = w.write_cb.take() else {
            drop(w);
            error_or_destroy(stream, StreamError::MultipleCallback);
            return;
        };
        w.writing = false;
        w.length = w.length.saturating_sub(w.write_len);
        w.write_len = 0;
        if let Some(err) = &err {
            w.lifecycle.record_error(err);
        }
        (w.sync, cb)
    };

    match err {
        Some(err) => {
            if let Some(mut r) = stream.rstate() {
                r.lifecycle.record_error(&err);
            }
            if sync {
                let s = stream.clone();
                next_tick(move || on_write_error(&s, err, cb));
            } else {
                on_write_error(stream, err, cb);
            }
        }
        None => {
            let has_buffered = stream.wstate().is_some_and(|w| !w.buffered.is_empty());
            if has_buffered {
                clear_buffer(stream);
            }
            if sync {
                let s = stream.clone();
                next_tick(move || after_write(&s, cb));
            } else {
                after_write(stream, cb);
            }
        }
    }
}

fn on_write_error(stream: &Stream, err: StreamError, cb: Callback) {
    if let Some(mut w) = stream.wstate() {
        w.pending_cb = w.pending_cb.saturating_sub(1);
    }
    cb(Some(err.clone()));
    error_buffer(stream);
    error_or_destroy(stream, err);
}

fn after_write(stream: &Stream, cb: Callback) {
    let need_drain = stream.wstate().is_some_and(|mut w| {
        let drain = !w.ending && !w.lifecycle.destroyed && w.length == 0 && w.need_drain;
        if drain {
            w.need_drain = false;
        }
        drain
    });
    if need_drain {
        stream.emit("drain", EventArg::None);
    }

    if let Some(mut w) = stream.wstate() {
        w.pending_cb = w.pending_cb.saturating_sub(1);
    }
    cb(None);

    if stream.any_lifecycle(|l| l.destroyed) {
        error_buffer(stream);
    }
    finish_maybe(stream, false);
}

/// Fail every buffered write and pending `end` callback.
pub(crate) fn error_buffer(stream: &Stream) {
    let (writes, finishers, errored) = {
        let Some(mut w) = stream.wstate() else {
            return;
        };
        if w.writing {
            return;
        }
        let writes: Vec<PendingWrite> = w.buffered.drain(..).collect();
        let object_mode = w.object_mode;
        for pending in &writes {
            let len = pending.chunk.buffered_len(object_mode);
            w.length = w.length.saturating_sub(len);
        }
        (
            writes,
            std::mem::take(&mut w.on_finished),
            w.lifecycle.errored.clone(),
        )
    };

    for pending in writes {
        let err = errored.clone().unwrap_or(StreamError::Destroyed("write"));
        (pending.callback)(Some(err));
    }
    for cb in finishers {
        cb(Some(errored.clone().unwrap_or(StreamError::Destroyed("end"))));
    }
}

/// On destroy, fail buffered writes on the next tick.
pub(crate) fn schedule_error_buffer(stream: &Stream) {
    let pending = stream.wstate().is_some_and(|w| {
        !w.lifecycle.destroyed && (!w.buffered.is_empty() || !w.on_finished.is_empty())
    });
    if pending {
        let s = stream.clone();
        next_tick(move || error_buffer(&s));
    }
}

/// Start writing buffered chunks unless corked, busy or not ready.
pub(crate) fn clear_buffer(stream: &Stream) {
    let start = stream.wstate().is_some_and(|mut w| {
        if w.corked > 0
            || w.buffer_processing
            || w.lifecycle.destroyed
            || !w.lifecycle.constructed
            || w.buffered.is_empty()
        {
            return false;
        }
        w.buffer_processing = true;
        true
    });
    if !start {
        return;
    }

    loop {
        let next = {
            let Some(mut w) = stream.wstate() else {
                return;
            };
            if w.writing {
                None
            } else {
                match w.buffered.pop_front() {
                    Some(pending) => {
                        w.write_len = pending.chunk.buffered_len(w.object_mode);
                        w.write_cb = Some(pending.callback);
                        w.writing = true;
                        w.sync = true;
                        Some(pending.chunk)
                    }
                    None => None,
                }
            }
        };
        let Some(chunk) = next else {
            break;
        };
        call_write_hook(stream, chunk);
        if let Some(mut w) = stream.wstate() {
            w.sync = false;
        }
    }

    if let Some(mut w) = stream.wstate() {
        w.buffer_processing = false;
    }
}

/// `end([chunk], [cb])`
pub(crate) fn end(stream: &Stream, chunk: Option<Chunk>, cb: Option<Callback>) {
    if !stream.has_writable() {
        if let Some(cb) = cb {
            next_tick(move || cb(Some(StreamError::NotImplemented("end"))));
        }
        return;
    }

    let mut err = None;
    if let Some(chunk) = chunk {
        if let Err(e) = write(stream, chunk, None) {
            err = Some(e);
        }
    }

    let uncork = stream.wstate().is_some_and(|mut w| {
        if w.corked > 0 {
            w.corked = 1;
            true
        } else {
            false
        }
    });
    if uncork {
        self::uncork(stream);
    }

    let start = match stream.wstate() {
        Some(mut w) if err.is_none() => {
            if w.lifecycle.errored.is_none() && !w.ending {
                w.ending = true;
                true
            } else {
                if w.finished {
                    err = Some(StreamError::AlreadyFinished("end"));
                } else if w.lifecycle.destroyed {
                    err = Some(StreamError::Destroyed("end"));
                }
                false
            }
        }
        _ => false,
    };
    if start {
        tracing::trace!(stream = stream.id(), "writable ending");
        finish_maybe(stream, true);
        if let Some(mut w) = stream.wstate() {
            w.ended = true;
        }
    }

    if let Some(cb) = cb {
        let finished = stream.writable_finished();
        if err.is_some() || finished {
            next_tick(move || cb(err));
        } else if let Some(mut w) = stream.wstate() {
            w.on_finished.push(cb);
        }
    }
}

/// Emit `finish` once every condition for it holds.
pub(crate) fn finish_maybe(stream: &Stream, sync: bool) {
    if !stream.wstate().is_some_and(|w| w.need_finish()) {
        return;
    }
    prefinish(stream);

    enum Next {
        Tick,
        Now,
    }
    let next = stream.wstate().and_then(|mut w| {
        if w.pending_cb != 0 {
            None
        } else if sync {
            w.pending_cb += 1;
            Some(Next::Tick)
        } else if w.need_finish() {
            w.pending_cb += 1;
            Some(Next::Now)
        } else {
            None
        }
    });

    match next {
        Some(Next::Tick) => {
            let s = stream.clone();
            next_tick(move || {
                let go = s.wstate().is_some_and(|mut w| {
                    if w.need_finish() {
                        true
                    } else {
                        w.pending_cb = w.pending_cb.saturating_sub(1);
                        false
                    }
                });
                if go {
                    finish(&s);
                }
            });
        }
        Some(Next::Now) => finish(stream),
        None => {}
    }
}

fn prefinish(stream: &Stream) {
    enum Next {
        CallFinal,
        Emit,
    }
    let has_final = stream.hooks().final_.is_some();
    let next = stream.wstate().and_then(|mut w| {
        if w.prefinished || w.final_called {
            None
        } else if has_final && !w.lifecycle.destroyed {
            w.final_called = true;
            Some(Next::CallFinal)
        } else {
            w.prefinished = true;
            Some(Next::Emit)
        }
    });
    match next {
        Some(Next::CallFinal) => call_final(stream),
        Some(Next::Emit) => {
            stream.emit("prefinish", EventArg::None);
        }
        None => {}
    }
}

fn call_final(stream: &Stream) {
    let Some(hook) = stream.hooks().final_.clone() else {
        return;
    };

    let called = Arc::new(AtomicBool::new(false));
    let on_final: Arc<dyn Fn(Option<StreamError>) + Send + Sync> = {
        let s = stream.clone();
        Arc::new(move |err| {
            if called.swap(true, Ordering::AcqRel) {
                error_or_destroy(&s, err.unwrap_or(StreamError::MultipleCallback));
                return;
            }
            if let Some(mut w) = s.wstate() {
                w.pending_cb = w.pending_cb.saturating_sub(1);
            }
            match err {
                Some(err) => {
                    let finishers = s
                        .wstate()
                        .map(|mut w| std::mem::take(&mut w.on_finished))
                        .unwrap_or_default();
                    for cb in finishers {
                        cb(Some(err.clone()));
                    }
                    error_or_destroy(&s, err);
                }
                None => {
                    let go = s.wstate().is_some_and(|mut w| {
                        if w.need_finish() {
                            w.prefinished = true;
                            true
                        } else {
                            false
                        }
                    });
                    if go {
                        s.emit("prefinish", EventArg::None);
                        if let Some(mut w) = s.wstate() {
                            w.pending_cb += 1;
                        }
                        let s2 = s.clone();
                        next_tick(move || finish(&s2));
                    }
                }
            }
        })
    };

    if let Some(mut w) = stream.wstate() {
        w.sync = true;
        w.pending_cb += 1;
    }
    let f = on_final.clone();
    if let Err(err) = hook(stream, Box::new(move |err| f(err))) {
        on_final(Some(err));
    }
    if let Some(mut w) = stream.wstate() {
        w.sync = false;
    }
}

fn finish(stream: &Stream) {
    let finishers = match stream.wstate() {
        Some(mut w) => {
            w.pending_cb = w.pending_cb.saturating_sub(1);
            w.finished = true;
            std::mem::take(&mut w.on_finished)
        }
        None => return,
    };
    for cb in finishers {
        cb(None);
    }
    tracing::trace!(stream = stream.id(), "writable finished");
    stream.emit("finish", EventArg::None);

    let auto_destroy = stream.wstate().is_some_and(|w| w.lifecycle.auto_destroy)
        && match stream.rstate() {
            None => true,
            Some(r) => r.lifecycle.auto_destroy && (r.end_emitted || !r.readable),
        };
    if auto_destroy {
        stream.destroy(None);
    }
}

pub(crate) fn cork(stream: &Stream) {
    if let Some(mut w) = stream.wstate() {
        w.corked += 1;
    }
}

pub(crate) fn uncork(stream: &Stream) {
    let flush = stream.wstate().is_some_and(|mut w| {
        if w.corked == 0 {
            return false;
        }
        w.corked -= 1;
        !w.writing
    });
    if flush {
        clear_buffer(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_runtime::run_until_idle;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn sink() -> (Stream, Arc<Mutex<Vec<String>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let w = written.clone();
        let stream = Stream::writable()
            .write(move |_, chunk, cb| {
                w.lock().push(chunk.as_str().unwrap_or_default().to_string());
                cb(None);
                Ok(())
            })
            .build();
        (stream, written)
    }

    fn events(stream: &Stream, names: &[&'static str]) -> Arc<Mutex<Vec<&'static str>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for &name in names {
            let l = log.clone();
            stream.on(name, move |_| l.lock().push(name));
        }
        log
    }

    #[test]
    fn test_write_then_end() {
        let (s, written) = sink();
        let log = events(&s, &["prefinish", "finish", "close"]);

        assert!(s.write("a"));
        assert!(s.write("b"));
        s.end();
        run_until_idle();

        assert_eq!(*written.lock(), vec!["a", "b"]);
        assert_eq!(*log.lock(), vec!["prefinish", "finish", "close"]);
        assert!(s.is_destroyed());
    }

    #[test]
    fn test_backpressure_and_drain() {
        let pending: Arc<Mutex<Vec<Callback>>> = Arc::new(Mutex::new(Vec::new()));
        let p = pending.clone();
        let s = Stream::writable()
            .high_water_mark(4)
            .write(move |_, _, cb| {
                p.lock().push(cb);
                Ok(())
            })
            .build();
        let drains = Arc::new(AtomicUsize::new(0));
        let d = drains.clone();
        s.on("drain", move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        assert!(s.write("ab"));
        assert!(!s.write("cd"));
        assert!(s.writable_need_drain());
        assert_eq!(s.writable_length(), 4);

        let cb = pending.lock().pop().unwrap();
        cb(None);
        let cb = pending.lock().pop().unwrap();
        cb(None);
        run_until_idle();

        assert_eq!(drains.load(Ordering::SeqCst), 1);
        assert_eq!(s.writable_length(), 0);
    }

    #[test]
    fn test_write_after_end() {
        let (s, _) = sink();
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        s.end();
        assert!(!s.write_with_callback("late", move |err| *r.lock() = err));
        run_until_idle();
        assert!(matches!(*result.lock(), Some(StreamError::WriteAfterEnd)));
    }

    #[test]
    fn test_write_after_destroy() {
        let (s, _) = sink();
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        s.destroy(None);
        s.write_with_callback("late", move |err| *r.lock() = err.and_then(|e| e.code()));
        run_until_idle();
        assert_eq!(*result.lock(), Some("ERR_STREAM_DESTROYED"));
    }

    #[test]
    fn test_end_after_finish() {
        let (s, _) = sink();
        s.end();
        run_until_idle();

        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        s.end_with(None, Some(Box::new(move |err| *r.lock() = err)));
        run_until_idle();
        assert!(matches!(
            *result.lock(),
            Some(StreamError::AlreadyFinished("end"))
        ));
    }

    #[test]
    fn test_end_callback_receives_write_error() {
        let s = Stream::writable()
            .write(|_, _, cb| {
                cb(Some(StreamError::msg("disk full")));
                Ok(())
            })
            .build();
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        s.on("error", |_| {});
        s.write("x");
        s.end_with(None, Some(Box::new(move |err| *o.lock() = err.map(|e| e.to_string()))));
        run_until_idle();
        assert_eq!(outcome.lock().as_deref(), Some("disk full"));
    }

    #[test]
    fn test_final_runs_before_finish() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let s = Stream::writable()
            .write(|_, _, cb| {
                cb(None);
                Ok(())
            })
            .final_(move |_, cb| {
                o.lock().push("final");
                cb(None);
                Ok(())
            })
            .build();
        let o = order.clone();
        s.on("finish", move |_| o.lock().push("finish"));
        s.end_with(Some(Chunk::from("last")), None);
        run_until_idle();
        assert_eq!(*order.lock(), vec!["final", "finish"]);
    }

    #[test]
    fn test_final_error_fails_end_callback() {
        let s = Stream::writable()
            .final_(|_, cb| {
                cb(Some(StreamError::msg("flush failed")));
                Ok(())
            })
            .build();
        s.on("error", |_| {});
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        s.end_with(None, Some(Box::new(move |err| *o.lock() = err.map(|e| e.to_string()))));
        run_until_idle();
        assert_eq!(outcome.lock().as_deref(), Some("flush failed"));
        assert!(s.is_destroyed());
        assert!(!s.writable_finished());
    }

    #[test]
    fn test_cork_buffers_until_uncork() {
        let (s, written) = sink();
        s.cork();
        s.write("a");
        s.write("b");
        assert!(written.lock().is_empty());
        s.uncork();
        assert_eq!(*written.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_destroy_fails_buffered_writes() {
        let pending: Arc<Mutex<Vec<Callback>>> = Arc::new(Mutex::new(Vec::new()));
        let p = pending.clone();
        let s = Stream::writable()
            .write(move |_, _, cb| {
                p.lock().push(cb);
                Ok(())
            })
            .build();
        let failed = Arc::new(Mutex::new(Vec::new()));
        for chunk in ["a", "b", "c"] {
            let f = failed.clone();
            s.write_with_callback(chunk, move |err| {
                f.lock().push(err.and_then(|e| e.code()));
            });
        }
        s.destroy(None);
        run_until_idle();
        assert!(failed.lock().is_empty());

        // the in-flight write completes, then the rest of the buffer fails
        let cb = pending.lock().pop().unwrap();
        cb(None);
        assert_eq!(
            *failed.lock(),
            vec![None, Some("ERR_STREAM_DESTROYED"), Some("ERR_STREAM_DESTROYED")]
        );
    }

    #[test]
    fn test_object_mode_counts_chunks() {
        let s = Stream::writable()
            .object_mode(true)
            .high_water_mark(2)
            .write(|_, _, _| Ok(()))
            .build();
        assert!(s.write(serde_json::json!({"n": 1})));
        assert!(!s.write(serde_json::json!({"n": 2})));
        assert_eq!(s.writable_length(), 2);
    }

    #[test]
    fn test_hook_error_emitted_on_later_tick() {
        let s = Stream::writable()
            .auto_destroy(false)
            .write(|_, _, cb| {
                cb(None);
                Err(StreamError::msg("thrown after callback"))
            })
            .build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let v = seen.clone();
        s.on("error", move |arg| {
            v.lock().push(arg.error().map(ToString::to_string));
        });

        s.write("x");
        assert!(seen.lock().is_empty());
        run_until_idle();
        assert_eq!(*seen.lock(), vec![Some("thrown after callback".to_string())]);
    }

    #[test]
    fn test_byte_mode_rejects_json() {
        let s = Stream::writable().write(|_, _, _| Ok(())).build();
        s.on("error", |_| {});
        let code = Arc::new(Mutex::new(None));
        let c = code.clone();
        s.write_with_callback(serde_json::json!(1), move |err| {
            *c.lock() = err.and_then(|e| e.code());
        });
        run_until_idle();
        assert_eq!(*code.lock(), Some("ERR_INVALID_ARG_TYPE"));
    }
}
