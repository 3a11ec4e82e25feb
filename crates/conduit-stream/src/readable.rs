//! Readable side: buffering, flowing/paused modes, `end` and `pipe`.

use crate::capability::StreamLike;
use crate::chunk::Chunk;
use crate::destroy::error_or_destroy;
use crate::error::StreamError;
use crate::events::EventArg;
use crate::state::ReadableState;
use crate::stream::{PipeOptions, Stream};
use conduit_events::ListenerId;
use conduit_runtime::next_tick;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

enum Added {
    Error(StreamError),
    Eof,
    Chunk(Chunk),
    ReadMore,
    Nothing,
}

/// `push`/`unshift` entry point.
pub(crate) fn add_chunk(stream: &Stream, chunk: Option<Chunk>, add_to_front: bool) -> bool {
    let step = {
        let Some(mut r) = stream.rstate() else {
            return false;
        };
        match chunk {
            None => {
                r.reading = false;
                Added::Eof
            }
            Some(Chunk::Json(_)) if !r.object_mode => Added::Error(StreamError::InvalidArgType {
                name: "chunk".into(),
                expected: "of type string or an instance of Bytes",
            }),
            Some(chunk) if r.object_mode || !chunk.is_empty() => {
                if add_to_front {
                    if r.end_emitted {
                        Added::Error(StreamError::UnshiftAfterEnd)
                    } else if r.lifecycle.destroyed || r.lifecycle.errored.is_some() {
                        return false;
                    } else {
                        Added::Chunk(chunk)
                    }
                } else if r.ended {
                    Added::Error(StreamError::PushAfterEof)
                } else if r.lifecycle.destroyed || r.lifecycle.errored.is_some() {
                    return false;
                } else {
                    r.reading = false;
                    Added::Chunk(chunk)
                }
            }
            Some(_) if !add_to_front => {
                r.reading = false;
                Added::ReadMore
            }
            Some(_) => Added::Nothing,
        }
    };

    match step {
        Added::Error(err) => error_or_destroy(stream, err),
        Added::Eof => on_eof_chunk(stream),
        Added::Chunk(chunk) => buffer_chunk(stream, chunk, add_to_front),
        Added::ReadMore => maybe_read_more(stream),
        Added::Nothing => {}
    }

    stream
        .rstate()
        .is_some_and(|r| !r.ended && (r.length < r.high_water_mark || r.length == 0))
}

fn buffer_chunk(stream: &Stream, chunk: Chunk, add_to_front: bool) {
    let data_listeners = stream.listener_count("data") > 0;
    let direct = {
        let Some(mut r) = stream.rstate() else {
            return;
        };
        if r.flowing == Some(true) && r.length == 0 && !r.sync && data_listeners {
            r.await_drain_writers.clear();
            r.data_emitted = true;
            Some(chunk)
        } else {
            r.length += chunk.buffered_len(r.object_mode);
            if add_to_front {
                r.buffer.push_front(chunk);
            } else {
                r.buffer.push_back(chunk);
            }
            None
        }
    };

    match direct {
        Some(chunk) => {
            stream.emit("data", EventArg::Chunk(chunk));
        }
        None => {
            if stream.rstate().is_some_and(|r| r.need_readable) {
                emit_readable(stream);
            }
        }
    }
    maybe_read_more(stream);
}

fn on_eof_chunk(stream: &Stream) {
    let sync = {
        let Some(mut r) = stream.rstate() else {
            return;
        };
        if r.ended {
            return;
        }
        r.ended = true;
        if !r.sync {
            r.need_readable = false;
            r.emitted_readable = true;
        }
        r.sync
    };
    if sync {
        emit_readable(stream);
    } else {
        emit_readable_now(stream);
    }
}

pub(crate) fn emit_readable(stream: &Stream) {
    let schedule = stream.rstate().is_some_and(|mut r| {
        r.need_readable = false;
        !std::mem::replace(&mut r.emitted_readable, true)
    });
    if schedule {
        let s = stream.clone();
        next_tick(move || emit_readable_now(&s));
    }
}

fn emit_readable_now(stream: &Stream) {
    let emit = stream.rstate().is_some_and(|r| {
        !r.lifecycle.destroyed && r.lifecycle.errored.is_none() && (r.length > 0 || r.ended)
    });
    if emit {
        stream.emit("readable", EventArg::None);
        if let Some(mut r) = stream.rstate() {
            r.emitted_readable = false;
        }
    }
    if let Some(mut r) = stream.rstate() {
        r.need_readable = r.flowing != Some(true) && !r.ended && r.length <= r.high_water_mark;
    }
    flow(stream);
}

fn flow(stream: &Stream) {
    while stream.readable_flowing() == Some(true) && read(stream, false).is_some() {}
}

/// Keep the buffer topped up to the high-water mark on a later tick.
pub(crate) fn maybe_read_more(stream: &Stream) {
    let schedule = stream.rstate().is_some_and(|mut r| {
        if !r.reading_more && r.lifecycle.constructed {
            r.reading_more = true;
            true
        } else {
            false
        }
    });
    if schedule {
        let s = stream.clone();
        next_tick(move || read_more_now(&s));
    }
}

fn read_more_now(stream: &Stream) {
    loop {
        let len = {
            let Some(r) = stream.rstate() else {
                return;
            };
            let wants_more = r.length < r.high_water_mark
                || (r.flowing == Some(true) && r.length == 0);
            if r.reading || r.ended || !wants_more {
                break;
            }
            r.length
        };
        read(stream, true);
        if stream.readable_length() == len {
            break;
        }
    }
    if let Some(mut r) = stream.rstate() {
        r.reading_more = false;
    }
}

/// Size of the next chunk a non-zero read would return.
fn how_much_to_read(r: &ReadableState, zero: bool) -> usize {
    if zero || (r.length == 0 && r.ended) {
        return 0;
    }
    r.buffer
        .front()
        .map_or(0, |chunk| chunk.buffered_len(r.object_mode))
}

/// Read the next chunk. With `zero`, only trigger the read hook and the
/// end/readable bookkeeping without consuming anything.
pub(crate) fn read(stream: &Stream, zero: bool) -> Option<Chunk> {
    let (n, hook_size) = {
        let mut r = stream.rstate()?;
        if !zero {
            r.emitted_readable = false;
        }

        let full = if r.high_water_mark != 0 {
            r.length >= r.high_water_mark
        } else {
            r.length > 0
        };
        if zero && r.need_readable && (full || r.ended) {
            let end = r.length == 0 && r.ended;
            drop(r);
            if end {
                end_readable(stream);
            } else {
                emit_readable(stream);
            }
            return None;
        }

        let n = how_much_to_read(&r, zero);
        if n == 0 && r.ended {
            let end = r.length == 0;
            drop(r);
            if end {
                end_readable(stream);
            }
            return None;
        }

        let do_read = (r.need_readable
            || r.length == 0
            || r.length.saturating_sub(n) < r.high_water_mark)
            && !r.ended
            && !r.reading
            && !r.lifecycle.destroyed
            && r.lifecycle.errored.is_none()
            && r.lifecycle.constructed;
        let hook_size = if do_read {
            r.reading = true;
            r.sync = true;
            if r.length == 0 {
                r.need_readable = true;
            }
            Some(r.high_water_mark)
        } else {
            None
        };
        (n, hook_size)
    };

    if let Some(size) = hook_size {
        let result = match stream.hooks().read.clone() {
            Some(hook) => hook(stream, size),
            None => Err(StreamError::NotImplemented("_read")),
        };
        if let Err(err) = result {
            error_or_destroy(stream, err);
        }
        if let Some(mut r) = stream.rstate() {
            r.sync = false;
        }
    }
    take_chunk(stream, zero, n)
}

fn take_chunk(stream: &Stream, zero: bool, mut n: usize) -> Option<Chunk> {
    let (ret, end) = {
        let mut r = stream.rstate()?;
        if !r.reading {
            n = how_much_to_read(&r, zero);
        }
        let ret = if n > 0 { r.buffer.pop_front() } else { None };
        match &ret {
            None => {
                r.need_readable = r.length <= r.high_water_mark;
            }
            Some(chunk) => {
                r.length -= chunk.buffered_len(r.object_mode).min(r.length);
                r.await_drain_writers.clear();
            }
        }

        let mut end = false;
        if r.length == 0 {
            if !r.ended {
                r.need_readable = true;
            }
            end = !zero && r.ended;
        }

        let emit = ret.is_some() && !r.lifecycle.error_emitted && !r.lifecycle.close_emitted;
        if emit {
            r.data_emitted = true;
        }
        (ret.map(|c| (c, emit)), end)
    };

    if end {
        end_readable(stream);
    }
    let (chunk, emit) = ret?;
    if emit {
        stream.emit("data", EventArg::Chunk(chunk.clone()));
    }
    Some(chunk)
}

pub(crate) fn end_readable(stream: &Stream) {
    let schedule = stream.rstate().is_some_and(|mut r| {
        if r.end_emitted {
            false
        } else {
            r.ended = true;
            true
        }
    });
    if schedule {
        let s = stream.clone();
        next_tick(move || end_readable_now(&s));
    }
}

fn end_readable_now(stream: &Stream) {
    let emit = stream.rstate().is_some_and(|mut r| {
        if r.lifecycle.errored.is_none()
            && !r.lifecycle.close_emitted
            && !r.end_emitted
            && r.length == 0
        {
            r.end_emitted = true;
            true
        } else {
            false
        }
    });
    if !emit {
        return;
    }

    tracing::trace!(stream = stream.id(), "readable ended");
    stream.emit("end", EventArg::None);

    if StreamLike::writable(stream) == Some(true) && !stream.allow_half_open() {
        let s = stream.clone();
        next_tick(move || {
            let open = StreamLike::writable(&s) == Some(true)
                && !s.writable_ended()
                && !s.is_destroyed();
            if open {
                s.end();
            }
        });
    } else if stream.rstate().is_some_and(|r| r.lifecycle.auto_destroy) {
        let auto_destroy = match stream.wstate() {
            None => true,
            Some(w) => w.lifecycle.auto_destroy && (w.finished || !w.writable),
        };
        if auto_destroy {
            stream.destroy(None);
        }
    }
}

/// React to a new `data` or `readable` listener.
pub(crate) fn on_listener_added(stream: &Stream, event: &str) {
    if !stream.has_readable() {
        return;
    }
    match event {
        "data" => {
            let readable_listening = stream.listener_count("readable") > 0;
            let resume_now = stream.rstate().is_some_and(|mut r| {
                r.readable_listening = readable_listening;
                r.flowing != Some(false)
            });
            if resume_now {
                resume(stream);
            }
        }
        "readable" => {
            enum Next {
                Emit,
                Poll,
            }
            let next = stream.rstate().and_then(|mut r| {
                if r.end_emitted || r.readable_listening {
                    return None;
                }
                r.readable_listening = true;
                r.need_readable = true;
                r.flowing = Some(false);
                r.emitted_readable = false;
                if r.length > 0 {
                    Some(Next::Emit)
                } else if !r.reading {
                    Some(Next::Poll)
                } else {
                    None
                }
            });
            match next {
                Some(Next::Emit) => emit_readable(stream),
                Some(Next::Poll) => {
                    let s = stream.clone();
                    next_tick(move || {
                        read(&s, true);
                    });
                }
                None => {}
            }
        }
        _ => {}
    }
}

/// Recompute the listening mode after a `readable` listener went away.
pub(crate) fn on_readable_listener_removed(stream: &Stream) {
    let s = stream.clone();
    next_tick(move || {
        let readable_listening = s.listener_count("readable") > 0;
        let data_listening = s.listener_count("data") > 0;
        let resume_now = s.rstate().is_some_and(|mut r| {
            r.readable_listening = readable_listening;
            if r.resume_scheduled && r.paused == Some(false) {
                r.flowing = Some(true);
                false
            } else if data_listening {
                true
            } else {
                if !r.readable_listening {
                    r.flowing = None;
                }
                false
            }
        });
        if resume_now {
            resume(&s);
        }
    });
}

pub(crate) fn resume(stream: &Stream) {
    let schedule = stream.rstate().is_some_and(|mut r| {
        let mut schedule = false;
        if r.flowing != Some(true) {
            r.flowing = Some(!r.readable_listening);
            if !r.resume_scheduled {
                r.resume_scheduled = true;
                schedule = true;
            }
        }
        r.paused = Some(false);
        schedule
    });
    if schedule {
        let s = stream.clone();
        next_tick(move || resume_now(&s));
    }
}

fn resume_now(stream: &Stream) {
    let reading = stream.rstate().is_some_and(|r| r.reading);
    if !reading {
        read(stream, true);
    }
    if let Some(mut r) = stream.rstate() {
        r.resume_scheduled = false;
    }
    stream.emit("resume", EventArg::None);
    flow(stream);
    let again = stream
        .rstate()
        .is_some_and(|r| r.flowing == Some(true) && !r.reading);
    if again {
        read(stream, true);
    }
}

pub(crate) fn pause(stream: &Stream) {
    let emit = stream.rstate().is_some_and(|mut r| {
        r.paused = Some(true);
        if r.flowing != Some(false) {
            r.flowing = Some(false);
            true
        } else {
            false
        }
    });
    if emit {
        stream.emit("pause", EventArg::None);
    }
}

/// Listener bookkeeping for one `src.pipe(dest)` link.
struct PipeLink {
    src: Stream,
    dest: Stream,
    cleaned_up: AtomicBool,
    ids: Mutex<PipeIds>,
}

#[derive(Default)]
struct PipeIds {
    end: Option<ListenerId>,
    data: Option<ListenerId>,
    unpipe: Option<ListenerId>,
    error: Option<ListenerId>,
    close: Option<ListenerId>,
    finish: Option<ListenerId>,
    drain: Option<ListenerId>,
}

impl PipeLink {
    fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids = std::mem::take(&mut *self.ids.lock());
        let on_dest = [
            ("close", ids.close),
            ("finish", ids.finish),
            ("drain", ids.drain),
            ("error", ids.error),
            ("unpipe", ids.unpipe),
        ];
        for (event, id) in on_dest {
            if let Some(id) = id {
                self.dest.off(event, id);
            }
        }
        for (event, id) in [("end", ids.end), ("data", ids.data)] {
            if let Some(id) = id {
                self.src.off(event, id);
            }
        }
        tracing::trace!(src = self.src.id(), dest = self.dest.id(), "pipe cleaned up");

        if ids.drain.is_some() && self.dest.writable_need_drain() {
            self.on_drain();
        }
    }

    fn pause_source(self: &Arc<Self>) {
        if !self.cleaned_up.load(Ordering::Acquire) {
            let dest_id = self.dest.id();
            if let Some(mut r) = self.src.rstate() {
                if r.pipes.iter().any(|p| p.id() == dest_id) {
                    r.await_drain_writers.insert(dest_id);
                }
            }
            self.src.pause();
        }
        let needs_drain_listener = self.ids.lock().drain.is_none();
        if needs_drain_listener {
            let link = self.clone();
            let id = self.dest.on("drain", move |_| link.on_drain());
            self.ids.lock().drain = Some(id);
        }
    }

    fn on_drain(&self) {
        let dest_id = self.dest.id();
        let drained = self.src.rstate().is_some_and(|mut r| {
            r.await_drain_writers.remove(&dest_id);
            r.await_drain_writers.is_empty()
        });
        if drained && self.src.listener_count("data") > 0 {
            self.src.resume();
        }
    }
}

pub(crate) fn pipe(src: &Stream, dest: &Stream, opts: PipeOptions) -> Stream {
    let end_emitted = match src.rstate() {
        Some(mut r) => {
            r.pipes.push(dest.clone());
            r.end_emitted
        }
        None => return dest.clone(),
    };
    tracing::trace!(src = src.id(), dest = dest.id(), end = opts.end, "pipe");

    let link = Arc::new(PipeLink {
        src: src.clone(),
        dest: dest.clone(),
        cleaned_up: AtomicBool::new(false),
        ids: Mutex::new(PipeIds::default()),
    });

    let on_end: Arc<dyn Fn() + Send + Sync> = {
        let link = link.clone();
        if opts.end {
            Arc::new(move || {
                link.dest.end();
            })
        } else {
            Arc::new(move || {
                link.src.unpipe(Some(&link.dest));
            })
        }
    };
    if end_emitted {
        next_tick(move || on_end());
    } else {
        let id = src.once("end", move |_| on_end());
        link.ids.lock().end = Some(id);
    }

    let unpipe_id = {
        let l = link.clone();
        dest.on("unpipe", move |arg| {
            if arg.stream_id() == Some(l.src.id()) {
                l.cleanup();
            }
        })
    };

    let error_id = {
        let l = link.clone();
        dest.prepend_listener("error", move |arg| {
            l.src.unpipe(Some(&l.dest));
            let own = l.ids.lock().error.take();
            if let Some(id) = own {
                l.dest.off("error", id);
            }
            if l.dest.listener_count("error") == 0 {
                let Some(err) = arg.error().cloned() else {
                    return;
                };
                let emitted = l.dest.any_lifecycle(|lc| lc.error_emitted);
                if !emitted {
                    error_or_destroy(&l.dest, err);
                } else {
                    l.dest.emit("error", EventArg::Error(err));
                }
            }
        })
    };

    let close_id = {
        let l = link.clone();
        dest.once("close", move |_| {
            let finish = l.ids.lock().finish.take();
            if let Some(id) = finish {
                l.dest.off("finish", id);
            }
            l.src.unpipe(Some(&l.dest));
        })
    };

    let finish_id = {
        let l = link.clone();
        dest.once("finish", move |_| {
            let close = l.ids.lock().close.take();
            if let Some(id) = close {
                l.dest.off("close", id);
            }
            l.src.unpipe(Some(&l.dest));
        })
    };

    {
        let mut ids = link.ids.lock();
        ids.unpipe = Some(unpipe_id);
        ids.error = Some(error_id);
        ids.close = Some(close_id);
        ids.finish = Some(finish_id);
    }

    let data_id = {
        let l = link.clone();
        src.on("data", move |arg| {
            let Some(chunk) = arg.chunk() else {
                return;
            };
            if !l.dest.write(chunk.clone()) {
                l.pause_source();
            }
        })
    };
    link.ids.lock().data = Some(data_id);

    dest.emit("pipe", EventArg::Stream(src.id()));

    if dest.writable_need_drain() {
        link.pause_source();
    } else if src.readable_flowing() != Some(true) {
        src.resume();
    }
    dest.clone()
}

pub(crate) fn unpipe(src: &Stream, dest: Option<&Stream>) {
    let (removed, now_empty) = {
        let Some(mut r) = src.rstate() else {
            return;
        };
        let removed: Vec<Stream> = match dest {
            None => std::mem::take(&mut r.pipes),
            Some(dest) => match r.pipes.iter().position(|p| p.same(dest)) {
                Some(index) => vec![r.pipes.remove(index)],
                None => Vec::new(),
            },
        };
        (removed, r.pipes.is_empty())
    };
    if removed.is_empty() {
        return;
    }
    if now_empty {
        src.pause();
    }
    for dest in removed {
        dest.emit("unpipe", EventArg::Stream(src.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use conduit_runtime::run_until_idle;
    use std::sync::atomic::AtomicUsize;

    fn collect_data(stream: &Stream) -> Arc<Mutex<Vec<String>>> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = out.clone();
        stream.on("data", move |arg| {
            if let Some(chunk) = arg.chunk() {
                o.lock().push(chunk.as_str().unwrap_or_default().to_string());
            }
        });
        out
    }

    fn source(items: &'static [&'static str]) -> Stream {
        let next = Arc::new(AtomicUsize::new(0));
        Stream::readable()
            .read(move |s, _| {
                let i = next.fetch_add(1, Ordering::SeqCst);
                match items.get(i) {
                    Some(item) => s.push(Some(Chunk::from(*item))),
                    None => s.push(None),
                };
                Ok(())
            })
            .build()
    }

    #[test]
    fn test_flowing_mode_delivers_in_order() {
        let s = source(&["a", "b", "c"]);
        let data = collect_data(&s);
        let ended = Arc::new(AtomicBool::new(false));
        let e = ended.clone();
        s.on("end", move |_| e.store(true, Ordering::SeqCst));

        run_until_idle();
        assert_eq!(*data.lock(), vec!["a", "b", "c"]);
        assert!(ended.load(Ordering::SeqCst));
        assert!(s.is_destroyed());
    }

    #[test]
    fn test_paused_mode_read() {
        let s = Stream::readable().read(|_, _| Ok(())).build();
        s.push(Some(Chunk::from("one")));
        s.push(Some(Chunk::from("two")));
        s.push(None);

        assert_eq!(s.read().and_then(|c| c.as_str().map(String::from)).as_deref(), Some("one"));
        assert_eq!(s.readable_length(), 3);
        assert_eq!(s.read().and_then(|c| c.as_str().map(String::from)).as_deref(), Some("two"));
        assert!(s.read().is_none());

        let ended = Arc::new(AtomicBool::new(false));
        let e = ended.clone();
        s.on("end", move |_| e.store(true, Ordering::SeqCst));
        run_until_idle();
        assert!(ended.load(Ordering::SeqCst));
    }

    #[test]
    fn test_readable_event() {
        let s = Stream::readable().read(|_, _| Ok(())).build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (seen2, s2) = (seen.clone(), s.clone());
        s.on("readable", move |_| {
            while let Some(chunk) = s2.read() {
                seen2.lock().push(chunk.as_str().unwrap_or_default().to_string());
            }
        });
        s.push(Some(Chunk::from("x")));
        s.push(None);
        run_until_idle();
        assert_eq!(*seen.lock(), vec!["x"]);
        assert!(s.readable_ended());
    }

    #[test]
    fn test_push_after_eof() {
        let s = Stream::readable().read(|_, _| Ok(())).build();
        let err = Arc::new(Mutex::new(None));
        let e = err.clone();
        s.on("error", move |arg| *e.lock() = arg.error().cloned());

        s.push(None);
        assert!(!s.push(Some(Chunk::from("late"))));
        run_until_idle();
        assert!(matches!(*err.lock(), Some(StreamError::PushAfterEof)));
    }

    #[test]
    fn test_unshift_after_end() {
        let s = Stream::readable()
            .auto_destroy(false)
            .read(|s, _| {
                s.push(None);
                Ok(())
            })
            .build();
        let _data = collect_data(&s);
        let code = Arc::new(Mutex::new(None));
        let c = code.clone();
        s.on("error", move |arg| *c.lock() = arg.error().and_then(StreamError::code));
        run_until_idle();
        assert!(s.readable_ended());

        s.unshift(Chunk::from("back"));
        assert!(code.lock().is_none());
        run_until_idle();
        assert_eq!(*code.lock(), Some("ERR_STREAM_UNSHIFT_AFTER_END_EVENT"));
    }

    #[test]
    fn test_push_error_emitted_on_later_tick() {
        let s = Stream::readable()
            .object_mode(true)
            .auto_destroy(false)
            .read(|_, _| Ok(()))
            .build();
        let errors = Arc::new(Mutex::new(0));
        let e = errors.clone();
        s.on("error", move |_| *e.lock() += 1);

        s.push(None);
        s.push(Some(Chunk::from(serde_json::json!(1))));
        assert_eq!(*errors.lock(), 0);
        run_until_idle();
        assert_eq!(*errors.lock(), 1);
        assert!(!s.is_destroyed());
    }

    #[test]
    fn test_unshift_puts_chunk_first() {
        let s = Stream::readable().read(|_, _| Ok(())).build();
        s.push(Some(Chunk::from("second")));
        s.unshift(Chunk::from("first"));
        assert_eq!(s.read().unwrap().as_str(), Some("first"));
        assert_eq!(s.read().unwrap().as_str(), Some("second"));
    }

    #[test]
    fn test_missing_read_hook() {
        let s = Stream::readable().build();
        let err = Arc::new(Mutex::new(None));
        let e = err.clone();
        s.on("error", move |arg| *e.lock() = arg.error().cloned());
        s.resume();
        run_until_idle();
        assert!(matches!(
            *err.lock(),
            Some(StreamError::NotImplemented("_read"))
        ));
    }

    #[test]
    fn test_byte_mode_rejects_json() {
        let s = Stream::readable().read(|_, _| Ok(())).build();
        let code = Arc::new(Mutex::new(None));
        let c = code.clone();
        s.on("error", move |arg| *c.lock() = arg.error().and_then(StreamError::code));
        s.push(Some(Chunk::from(serde_json::json!({"a": 1}))));
        run_until_idle();
        assert_eq!(*code.lock(), Some("ERR_INVALID_ARG_TYPE"));
    }

    #[test]
    fn test_pause_and_resume() {
        let s = Stream::readable().read(|_, _| Ok(())).build();
        let data = collect_data(&s);
        s.pause();
        assert!(s.is_paused());
        s.push(Some(Chunk::from("held")));
        run_until_idle();
        assert!(data.lock().is_empty());

        s.resume();
        run_until_idle();
        assert_eq!(*data.lock(), vec!["held"]);
    }

    #[test]
    fn test_pipe_forwards_and_ends() {
        let src = source(&["a", "b"]);
        let written = Arc::new(Mutex::new(Vec::new()));
        let w = written.clone();
        let dest = Stream::writable()
            .write(move |_, chunk, cb| {
                w.lock().push(chunk.as_str().unwrap_or_default().to_string());
                cb(None);
                Ok(())
            })
            .build();
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        dest.on("finish", move |_| f.store(true, Ordering::SeqCst));

        src.pipe(&dest);
        run_until_idle();
        assert_eq!(*written.lock(), vec!["a", "b"]);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_pipe_without_end() {
        let src = source(&["only"]);
        let dest = Stream::writable()
            .write(|_, _, cb| {
                cb(None);
                Ok(())
            })
            .build();
        src.pipe_with(&dest, PipeOptions { end: false });
        run_until_idle();
        assert!(!dest.writable_ended());
        assert_eq!(dest.listener_count("unpipe"), 0);
    }

    #[test]
    fn test_unpipe_detaches() {
        let src = Stream::readable().read(|_, _| Ok(())).build();
        let dest = Stream::writable()
            .write(|_, _, cb| {
                cb(None);
                Ok(())
            })
            .build();
        src.pipe(&dest);
        assert_eq!(src.listener_count("data"), 1);

        src.unpipe(Some(&dest));
        assert_eq!(src.listener_count("data"), 0);
        assert_eq!(dest.listener_count("unpipe"), 0);
        assert!(src.is_paused());
    }

    #[test]
    fn test_pipe_backpressure_waits_for_drain() {
        let pending: Arc<Mutex<Vec<crate::stream::Callback>>> = Arc::new(Mutex::new(Vec::new()));
        let p = pending.clone();
        let dest = Stream::writable()
            .high_water_mark(2)
            .write(move |_, _, cb| {
                p.lock().push(cb);
                Ok(())
            })
            .build();
        let src = Stream::readable().read(|_, _| Ok(())).build();
        for chunk in ["aa", "bb", "cc"] {
            src.push(Some(Chunk::from(chunk)));
        }
        src.pipe(&dest);
        run_until_idle();

        assert!(src.is_paused());
        assert_eq!(src.readable_length(), 4);

        let cbs = std::mem::take(&mut *pending.lock());
        for cb in cbs {
            cb(None);
        }
        run_until_idle();
        let cbs = std::mem::take(&mut *pending.lock());
        for cb in cbs {
            cb(None);
        }
        run_until_idle();
        assert_eq!(src.readable_length(), 0);
    }
}
