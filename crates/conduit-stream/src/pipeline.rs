//! Pipeline orchestrator.
//!
//! Pipes every stage into the next one, watches each with an EOS waiter and
//! tears every stage down as soon as one of them fails. The completion
//! callback runs exactly once, with the first error observed (a premature
//! close gives way to a later concrete error).

use crate::capability::{
    StreamLike, is_readable, is_readable_finished, is_readable_node_stream,
    is_writable_node_stream,
};
use crate::chunk::Chunk;
use crate::destroy::destroyer;
use crate::eos::{Cleanup, EosOptions, eos};
use crate::error::{StreamError, StreamResult};
use crate::from::{ChunkSource, TransformFn, from_source};
use crate::once::Once;
use crate::stream::{PipeOptions, Stream};
use conduit_events::{AbortSignal, ListenerId};
use conduit_runtime::next_tick;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

/// One link of a pipeline.
pub enum Stage {
    Stream(Stream),
    /// Iterator of chunks; only valid as the first stage.
    Source(ChunkSource),
    /// Chunk mapper, run as an object-mode transform.
    Transform(TransformFn),
}

impl Stage {
    pub fn source<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = StreamResult<Chunk>>,
        I::IntoIter: Send + 'static,
    {
        Stage::Source(Box::new(iter.into_iter()))
    }

    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(Chunk) -> StreamResult<Option<Chunk>> + Send + Sync + 'static,
    {
        Stage::Transform(Arc::new(f))
    }

    pub(crate) fn into_stream(self) -> Stream {
        match self {
            Stage::Stream(s) => s,
            Stage::Source(source) => from_source(source),
            Stage::Transform(f) => Stream::from_fn(f),
        }
    }
}

impl From<Stream> for Stage {
    fn from(stream: Stream) -> Self {
        Stage::Stream(stream)
    }
}

impl From<&Stream> for Stage {
    fn from(stream: &Stream) -> Self {
        Stage::Stream(stream.clone())
    }
}

/// Options for [`pipeline_with`] and [`pipeline_async`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Aborting tears the whole pipeline down.
    pub signal: Option<AbortSignal>,
    /// End the last stage when the source ends (default `true`).
    pub end: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            signal: None,
            end: true,
        }
    }
}

type Teardown = Box<dyn FnOnce(Option<StreamError>) + Send>;

struct RunState {
    error: Option<StreamError>,
    destroys: VecDeque<Teardown>,
    finish_count: isize,
    last_stream_cleanup: Vec<Box<dyn FnOnce() + Send>>,
    abort_listener: Option<ListenerId>,
}

struct Run {
    state: Mutex<RunState>,
    callback: Once<Option<StreamError>>,
    signal: Option<AbortSignal>,
    stages: usize,
}

impl Run {
    fn finish(self: &Arc<Self>, err: Option<StreamError>) {
        let last = {
            let mut st = self.state.lock();
            st.finish_count -= 1;
            st.finish_count == 0
        };
        self.finish_impl(err, last);
    }

    fn finish_impl(self: &Arc<Self>, err: Option<StreamError>, last: bool) {
        let (error, destroys, listener, cleanups) = {
            let mut st = self.state.lock();
            if let Some(err) = err {
                if st.error.as_ref().is_none_or(StreamError::is_premature_close) {
                    st.error = Some(err);
                }
            }
            if st.error.is_none() && !last {
                return;
            }
            let cleanups = if last && st.error.is_none() {
                std::mem::take(&mut st.last_stream_cleanup)
            } else {
                Vec::new()
            };
            (
                st.error.clone(),
                std::mem::take(&mut st.destroys),
                st.abort_listener.take(),
                cleanups,
            )
        };

        for destroy in destroys {
            destroy(error.clone());
        }
        if let (Some(signal), Some(id)) = (&self.signal, listener) {
            signal.remove_listener(id);
        }
        if last {
            for cleanup in cleanups {
                cleanup();
            }
            tracing::debug!(stages = self.stages, error = ?error, "pipeline finished");
            let run = self.clone();
            next_tick(move || {
                run.callback.call(error);
            });
        }
    }

    fn abort(self: &Arc<Self>) {
        let reason = self.signal.as_ref().and_then(AbortSignal::reason);
        self.finish_impl(Some(StreamError::aborted(reason)), false);
    }
}

/// Destroy `stream` on pipeline failure unless it already completed.
fn stage_destroyer(
    stream: &Stream,
    reading: bool,
    writing: bool,
) -> StreamResult<(Teardown, Cleanup)> {
    let finished = Arc::new(AtomicBool::new(false));
    let f = finished.clone();
    stream.on("close", move |_| f.store(true, Ordering::Release));
    let f = finished.clone();
    let cleanup = eos(
        stream,
        EosOptions::default().readable(reading).writable(writing),
        move |err| f.store(err.is_none(), Ordering::Release),
    )?;

    let s = stream.clone();
    let teardown: Teardown = Box::new(move |err| {
        if finished.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!(stream = s.id(), "pipeline tearing down stage");
        destroyer(&s, Some(err.unwrap_or(StreamError::Destroyed("pipe"))));
    });
    Ok((teardown, cleanup))
}

/// Pipe `src` into `dst`, reporting both sides to `run`.
fn pipe(run: &Arc<Run>, src: &Stream, dst: &Stream, end: bool) -> StreamResult<Cleanup> {
    run.state.lock().finish_count += 2;

    let ended = Arc::new(AtomicBool::new(false));
    {
        let run = run.clone();
        let ended = ended.clone();
        dst.on("close", move |_| {
            if !ended.load(Ordering::Acquire) {
                run.finish(Some(StreamError::PrematureClose));
            }
        });
    }

    src.pipe_with(dst, PipeOptions { end: false });

    if end {
        let end_fn = {
            let dst = dst.clone();
            let ended = ended.clone();
            Arc::new(move || {
                ended.store(true, Ordering::Release);
                dst.end();
            })
        };
        if is_readable_finished(src, true) == Some(true) {
            let f = end_fn.clone();
            next_tick(move || f());
        } else {
            let f = end_fn.clone();
            src.once("end", move |_| f());
        }

        let r = run.clone();
        let source = src.clone();
        eos(
            src,
            EosOptions::default().readable(true).writable(false),
            move |err| {
                let ended_cleanly = source.readable_state().is_some_and(|rs| {
                    rs.ended && rs.lifecycle.errored.is_none() && !rs.lifecycle.error_emitted
                });
                match err {
                    Some(err) if err.is_premature_close() && ended_cleanly => {
                        // `end` is still on its way
                        let f = end_fn.clone();
                        source.once("end", move |_| f());
                        let r2 = r.clone();
                        source.once("error", move |arg| {
                            r2.finish(arg.error().cloned());
                        });
                    }
                    err => r.finish(err),
                }
            },
        )?;
    } else {
        run.finish(None);
    }

    let r = run.clone();
    eos(
        dst,
        EosOptions::default().readable(false).writable(true),
        move |err| r.finish(err),
    )
}

/// Connect `stages` and call `callback` once with the overall outcome.
pub fn pipeline<F>(stages: Vec<Stage>, callback: F) -> StreamResult<Stream>
where
    F: FnOnce(Option<StreamError>) + Send + 'static,
{
    pipeline_with(stages, PipelineOptions::default(), callback)
}

/// [`pipeline`] with options. Returns the last stage.
///
/// Fails without wiring anything when fewer than two stages are given or a
/// stage cannot play its role.
pub fn pipeline_with<F>(
    stages: Vec<Stage>,
    opts: PipelineOptions,
    callback: F,
) -> StreamResult<Stream>
where
    F: FnOnce(Option<StreamError>) + Send + 'static,
{
    if stages.len() < 2 {
        return Err(StreamError::MissingArgs("streams"));
    }
    let streams: Vec<Stream> = stages.into_iter().map(Stage::into_stream).collect();
    let last = streams.len() - 1;
    for (i, s) in streams.iter().enumerate() {
        if i < last && !is_readable_node_stream(s, false) {
            return Err(StreamError::InvalidArgValue {
                name: format!("streams[{i}]"),
                reason: "must be readable",
            });
        }
        if i > 0 && !is_writable_node_stream(s) {
            return Err(StreamError::InvalidArgValue {
                name: format!("streams[{i}]"),
                reason: "must be writable",
            });
        }
    }

    let run = Arc::new(Run {
        state: Mutex::new(RunState {
            error: None,
            destroys: VecDeque::new(),
            finish_count: 0,
            last_stream_cleanup: Vec::new(),
            abort_listener: None,
        }),
        callback: Once::new(callback),
        signal: opts.signal.clone(),
        stages: streams.len(),
    });
    tracing::trace!(stages = streams.len(), "pipeline started");

    if let Some(signal) = &opts.signal {
        let r = run.clone();
        let id = signal.on_abort(move |_| r.abort());
        run.state.lock().abort_listener = Some(id);
    }

    for (i, stream) in streams.iter().enumerate() {
        let reading = i < last;
        let writing = i > 0;
        let end = reading || opts.end;
        let is_last = i == last;
        let readable_last = is_last && is_readable(stream) == Some(true);

        if end {
            let (teardown, cleanup) = stage_destroyer(stream, reading, writing)?;
            let mut st = run.state.lock();
            st.destroys.push_back(teardown);
            if readable_last {
                st.last_stream_cleanup.push(Box::new(move || cleanup.run()));
            }
        }

        // Errors raised after piping completed.
        let r = run.clone();
        let id = stream.on("error", move |arg| {
            if let Some(err) = arg.error() {
                if !err.is_abort() && !err.is_premature_close() {
                    r.finish(Some(err.clone()));
                }
            }
        });
        if readable_last {
            let s = stream.clone();
            run.state
                .lock()
                .last_stream_cleanup
                .push(Box::new(move || {
                    s.off("error", id);
                }));
        }

        if i > 0 {
            let cleanup = pipe(&run, &streams[i - 1], stream, end)?;
            if readable_last {
                run.state
                    .lock()
                    .last_stream_cleanup
                    .push(Box::new(move || cleanup.run()));
            }
        }
    }

    if opts.signal.as_ref().is_some_and(AbortSignal::aborted) {
        let r = run.clone();
        next_tick(move || r.abort());
    }

    Ok(streams[last].clone())
}

/// Future form of [`pipeline_with`]: resolves once every stage finished.
pub fn pipeline_async(
    stages: Vec<Stage>,
    opts: PipelineOptions,
) -> impl Future<Output = StreamResult<()>> + Send + 'static {
    let (tx, rx) = oneshot::channel();
    let started = pipeline_with(stages, opts, move |err| {
        let _ = tx.send(match err {
            Some(err) => Err(err),
            None => Ok(()),
        });
    })
    .map(drop);

    async move {
        if let Err(err) = started {
            return Err(err);
        }
        rx.await.unwrap_or(Err(StreamError::PrematureClose))
    }
}
