//! The concrete stream type.
//!
//! A [`Stream`] is a cheap, cloneable handle. It owns up to two state
//! blobs (readable and writable), the user hooks, and the lifecycle slots
//! the destroy/construct machine parks callbacks in. Readable-only,
//! writable-only, duplex and transform streams are all the same type and
//! differ only in which blobs and hooks they carry.

use crate::capability::{Capabilities, StreamLike};
use crate::chunk::Chunk;
use crate::config::get_default_high_water_mark;
use crate::error::{StreamError, StreamResult};
use crate::events::{EventArg, StreamEvents};
use crate::state::{Lifecycle, ReadableState, ReadableView, WritableState, WritableView};
use crate::{destroy, readable, transform, writable};
use conduit_events::ListenerId;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Completion callback: `None` on success.
pub type Callback = Box<dyn FnOnce(Option<StreamError>) + Send>;

/// `_read(size)`: produce data with [`Stream::push`].
pub type ReadHook = Arc<dyn Fn(&Stream, usize) -> StreamResult<()> + Send + Sync>;
/// `_write(chunk, cb)`
pub type WriteHook = Arc<dyn Fn(&Stream, Chunk, Callback) -> StreamResult<()> + Send + Sync>;
/// `_final(cb)`: runs once before `finish`.
pub type FinalHook = Arc<dyn Fn(&Stream, Callback) -> StreamResult<()> + Send + Sync>;
/// `_construct(cb)`: deferred setup.
pub type ConstructHook = Arc<dyn Fn(&Stream, Callback) -> StreamResult<()> + Send + Sync>;
/// `_destroy(err, cb)`: teardown.
pub type DestroyHook =
    Arc<dyn Fn(&Stream, Option<StreamError>, Callback) -> StreamResult<()> + Send + Sync>;

/// Maps one input chunk of a transform to at most one output chunk.
pub type TransformHook =
    Arc<dyn Fn(&Stream, Chunk) -> StreamResult<Option<Chunk>> + Send + Sync>;
/// Runs once the writable side of a transform ended.
pub type FlushHook = Arc<dyn Fn(&Stream) -> StreamResult<Option<Chunk>> + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub read: Option<ReadHook>,
    pub write: Option<WriteHook>,
    pub final_: Option<FinalHook>,
    pub construct: Option<ConstructHook>,
    pub destroy: Option<DestroyHook>,
}

/// Callbacks parked by the destroy/construct machine.
#[derive(Default)]
pub(crate) struct Slots {
    /// Run once construction completes successfully
    pub construct_waiters: Vec<Box<dyn FnOnce() + Send>>,
    pub construct_scheduled: bool,
    pub construct_done: bool,
    /// Destroy requested while construction was pending
    pub destroy_deferred: Option<(Option<StreamError>, Option<Callback>)>,
    /// Set once the destroy hook completed
    pub destroy_outcome: Option<Option<StreamError>>,
    /// Repeated `destroy` callbacks waiting for the first teardown
    pub destroy_waiters: Vec<Callback>,
}

pub(crate) struct Inner {
    id: u64,
    events: StreamEvents,
    readable: Option<Mutex<ReadableState>>,
    writable: Option<Mutex<WritableState>>,
    hooks: Hooks,
    slots: Mutex<Slots>,
    allow_half_open: bool,
}

/// Readable, Writable, Duplex or Transform stream.
#[derive(Clone)]
pub struct Stream(Arc<Inner>);

/// Non-owning handle to a [`Stream`].
#[derive(Clone)]
pub struct WeakStream(Weak<Inner>);

impl WeakStream {
    pub fn upgrade(&self) -> Option<Stream> {
        self.0.upgrade().map(Stream)
    }
}

/// Options for [`Stream::pipe_with`].
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// End the destination when the source ends
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

impl Stream {
    /// Builder for a readable-only stream.
    pub fn readable() -> StreamBuilder {
        StreamBuilder::new(true, false)
    }

    /// Builder for a writable-only stream.
    pub fn writable() -> StreamBuilder {
        StreamBuilder::new(false, true)
    }

    /// Builder for a duplex stream.
    pub fn duplex() -> StreamBuilder {
        StreamBuilder::new(true, true)
    }

    /// Builder for a transform stream mapping each written chunk through `f`.
    pub fn transform<F>(f: F) -> StreamBuilder
    where
        F: Fn(&Stream, Chunk) -> StreamResult<Option<Chunk>> + Send + Sync + 'static,
    {
        let mut builder = StreamBuilder::new(true, true);
        builder.transform = Some(Arc::new(f));
        builder
    }

    /// Builder for a transform that forwards chunks unchanged.
    pub fn pass_through() -> StreamBuilder {
        Self::transform(|_, chunk| Ok(Some(chunk)))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Whether both handles refer to the same stream.
    pub fn same(&self, other: &Stream) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakStream {
        WeakStream(Arc::downgrade(&self.0))
    }

    pub fn has_readable(&self) -> bool {
        self.0.readable.is_some()
    }

    pub fn has_writable(&self) -> bool {
        self.0.writable.is_some()
    }

    pub fn allow_half_open(&self) -> bool {
        self.0.allow_half_open
    }

    pub(crate) fn rstate(&self) -> Option<MutexGuard<'_, ReadableState>> {
        self.0.readable.as_ref().map(|m| m.lock())
    }

    pub(crate) fn wstate(&self) -> Option<MutexGuard<'_, WritableState>> {
        self.0.writable.as_ref().map(|m| m.lock())
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.0.hooks
    }

    pub(crate) fn slots(&self) -> MutexGuard<'_, Slots> {
        self.0.slots.lock()
    }

    /// Apply `f` to the lifecycle bits of every present direction.
    pub(crate) fn each_lifecycle(&self, mut f: impl FnMut(&mut Lifecycle)) {
        if let Some(mut r) = self.rstate() {
            f(&mut r.lifecycle);
        }
        if let Some(mut w) = self.wstate() {
            f(&mut w.lifecycle);
        }
    }

    /// Whether `f` holds for the lifecycle of any present direction.
    pub(crate) fn any_lifecycle(&self, f: impl Fn(&Lifecycle) -> bool) -> bool {
        let w = self.wstate().is_some_and(|w| f(&w.lifecycle));
        w || self.rstate().is_some_and(|r| f(&r.lifecycle))
    }

    // Events

    /// Add a listener. `data` listeners switch a readable into flowing mode
    /// and `readable` listeners into paused mode.
    pub fn on<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventArg) + Send + Sync + 'static,
    {
        let id = self.0.events.on(event, f);
        readable::on_listener_added(self, event);
        id
    }

    pub fn once<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventArg) + Send + Sync + 'static,
    {
        let id = self.0.events.once(event, f);
        readable::on_listener_added(self, event);
        id
    }

    pub fn prepend_listener<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventArg) + Send + Sync + 'static,
    {
        self.0.events.prepend_listener(event, f)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let removed = self.0.events.off(event, id);
        if removed && event == "readable" {
            readable::on_readable_listener_removed(self);
        }
        removed
    }

    pub fn emit(&self, event: &str, arg: EventArg) -> bool {
        self.0.events.emit(event, arg)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.0.events.listener_count(event)
    }

    // Readable side

    /// Queue `Some(chunk)` for consumers, or signal end-of-data with `None`.
    ///
    /// Returns `false` once the buffer reached the high-water mark.
    pub fn push(&self, chunk: Option<Chunk>) -> bool {
        readable::add_chunk(self, chunk, false)
    }

    /// Put a chunk back at the front of the read buffer.
    pub fn unshift(&self, chunk: Chunk) -> bool {
        readable::add_chunk(self, Some(chunk), true)
    }

    /// Take the next buffered chunk, asking the read hook for more data.
    pub fn read(&self) -> Option<Chunk> {
        readable::read(self, false)
    }

    pub fn resume(&self) -> &Self {
        readable::resume(self);
        self
    }

    pub fn pause(&self) -> &Self {
        readable::pause(self);
        self
    }

    pub fn is_paused(&self) -> bool {
        self.rstate()
            .is_some_and(|r| r.paused == Some(true) || r.flowing == Some(false))
    }

    /// Forward every chunk to `dest`, ending it when this stream ends.
    pub fn pipe(&self, dest: &Stream) -> Stream {
        readable::pipe(self, dest, PipeOptions::default())
    }

    pub fn pipe_with(&self, dest: &Stream, opts: PipeOptions) -> Stream {
        readable::pipe(self, dest, opts)
    }

    /// Detach `dest`, or every destination when `None`.
    pub fn unpipe(&self, dest: Option<&Stream>) -> &Self {
        readable::unpipe(self, dest);
        self
    }

    pub fn readable_length(&self) -> usize {
        self.rstate().map_or(0, |r| r.length)
    }

    pub fn readable_flowing(&self) -> Option<bool> {
        self.rstate().and_then(|r| r.flowing)
    }

    pub fn readable_ended(&self) -> bool {
        self.rstate().is_some_and(|r| r.end_emitted)
    }

    pub fn readable_high_water_mark(&self) -> usize {
        self.rstate().map_or(0, |r| r.high_water_mark)
    }

    pub fn readable_object_mode(&self) -> bool {
        self.rstate().is_some_and(|r| r.object_mode)
    }

    // Writable side

    /// Write a chunk. `false` means the caller should wait for `drain`.
    pub fn write(&self, chunk: impl Into<Chunk>) -> bool {
        writable::write(self, chunk.into(), None).unwrap_or(false)
    }

    pub fn write_with_callback<F>(&self, chunk: impl Into<Chunk>, cb: F) -> bool
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
    {
        writable::write(self, chunk.into(), Some(Box::new(cb))).unwrap_or(false)
    }

    /// Signal that no more data will be written.
    pub fn end(&self) -> &Self {
        writable::end(self, None, None);
        self
    }

    /// Optionally write a final chunk, then end. `cb` runs on `finish` or
    /// with the error that prevented it.
    pub fn end_with(&self, chunk: Option<Chunk>, cb: Option<Callback>) -> &Self {
        writable::end(self, chunk, cb);
        self
    }

    /// Buffer writes until [`Stream::uncork`].
    pub fn cork(&self) {
        writable::cork(self);
    }

    pub fn uncork(&self) {
        writable::uncork(self);
    }

    pub fn writable_length(&self) -> usize {
        self.wstate().map_or(0, |w| w.length)
    }

    pub fn writable_need_drain(&self) -> bool {
        self.wstate().is_some_and(|w| w.need_drain)
    }

    pub fn writable_ended(&self) -> bool {
        self.wstate().is_some_and(|w| w.ending)
    }

    pub fn writable_finished(&self) -> bool {
        self.wstate().is_some_and(|w| w.finished)
    }

    pub fn writable_high_water_mark(&self) -> usize {
        self.wstate().map_or(0, |w| w.high_water_mark)
    }

    pub fn writable_object_mode(&self) -> bool {
        self.wstate().is_some_and(|w| w.object_mode)
    }

    // Lifecycle

    /// Tear the stream down, optionally with an error. Idempotent.
    pub fn destroy(&self, err: Option<StreamError>) -> &Self {
        destroy::destroy(self, err, None);
        self
    }

    /// Like [`Stream::destroy`]; `cb` receives the teardown outcome.
    pub fn destroy_with_callback<F>(&self, err: Option<StreamError>, cb: F) -> &Self
    where
        F: FnOnce(Option<StreamError>) + Send + 'static,
    {
        destroy::destroy(self, err, Some(Box::new(cb)));
        self
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed() == Some(true)
    }

    pub fn errored(&self) -> Option<StreamError> {
        let w = self.wstate().and_then(|w| w.lifecycle.errored.clone());
        w.or_else(|| self.rstate().and_then(|r| r.lifecycle.errored.clone()))
    }
}

impl StreamLike for Stream {
    fn events(&self) -> &StreamEvents {
        &self.0.events
    }

    fn readable_state(&self) -> Option<ReadableView> {
        self.rstate().map(|r| r.view())
    }

    fn writable_state(&self) -> Option<WritableView> {
        self.wstate().map(|w| w.view())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            pipe: self.has_readable(),
            write: self.has_writable(),
            pause_resume: self.has_readable(),
            destroy: true,
            close: false,
        }
    }

    fn readable(&self) -> Option<bool> {
        let r = self.rstate()?;
        Some(
            r.readable
                && !r.lifecycle.destroyed
                && !r.lifecycle.error_emitted
                && !r.end_emitted,
        )
    }

    fn writable(&self) -> Option<bool> {
        let w = self.wstate()?;
        Some(
            w.writable
                && !w.lifecycle.destroyed
                && w.lifecycle.errored.is_none()
                && !w.ending
                && !w.ended,
        )
    }

    fn destroyed(&self) -> Option<bool> {
        let r = self.rstate().map(|r| r.lifecycle.destroyed);
        let w = self.wstate().map(|w| w.lifecycle.destroyed);
        match (r, w) {
            (Some(r), Some(w)) => Some(r && w),
            (r, w) => r.or(w),
        }
    }

    fn closed(&self) -> Option<bool> {
        let w = self.wstate().map(|w| w.lifecycle.closed);
        w.or_else(|| self.rstate().map(|r| r.lifecycle.closed))
    }

    fn destroy(&self, err: Option<StreamError>) {
        destroy::destroy(self, err, None);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.0.id)
            .field("readable", &self.has_readable())
            .field("writable", &self.has_writable())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Configures and builds a [`Stream`].
pub struct StreamBuilder {
    has_readable: bool,
    has_writable: bool,
    readable_object_mode: bool,
    writable_object_mode: bool,
    readable_high_water_mark: Option<usize>,
    writable_high_water_mark: Option<usize>,
    emit_close: bool,
    auto_destroy: bool,
    allow_half_open: bool,
    readable_enabled: bool,
    writable_enabled: bool,
    hooks: Hooks,
    pub(crate) transform: Option<TransformHook>,
    flush: Option<FlushHook>,
}

impl StreamBuilder {
    fn new(has_readable: bool, has_writable: bool) -> Self {
        Self {
            has_readable,
            has_writable,
            readable_object_mode: false,
            writable_object_mode: false,
            readable_high_water_mark: None,
            writable_high_water_mark: None,
            emit_close: true,
            auto_destroy: true,
            allow_half_open: true,
            readable_enabled: true,
            writable_enabled: true,
            hooks: Hooks::default(),
            transform: None,
            flush: None,
        }
    }

    /// Object mode for both directions.
    pub fn object_mode(mut self, on: bool) -> Self {
        self.readable_object_mode = on;
        self.writable_object_mode = on;
        self
    }

    pub fn readable_object_mode(mut self, on: bool) -> Self {
        self.readable_object_mode = on;
        self
    }

    pub fn writable_object_mode(mut self, on: bool) -> Self {
        self.writable_object_mode = on;
        self
    }

    /// High-water mark for both directions.
    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.readable_high_water_mark = Some(hwm);
        self.writable_high_water_mark = Some(hwm);
        self
    }

    pub fn readable_high_water_mark(mut self, hwm: usize) -> Self {
        self.readable_high_water_mark = Some(hwm);
        self
    }

    pub fn writable_high_water_mark(mut self, hwm: usize) -> Self {
        self.writable_high_water_mark = Some(hwm);
        self
    }

    /// Emit `close` after teardown (default `true`).
    pub fn emit_close(mut self, on: bool) -> Self {
        self.emit_close = on;
        self
    }

    /// Destroy after `end`/`finish` or on error (default `true`).
    pub fn auto_destroy(mut self, on: bool) -> Self {
        self.auto_destroy = on;
        self
    }

    /// Keep the writable side open after the readable side ended
    /// (default `true`).
    pub fn allow_half_open(mut self, on: bool) -> Self {
        self.allow_half_open = on;
        self
    }

    /// Start the readable side of a duplex already ended.
    pub fn readable_enabled(mut self, on: bool) -> Self {
        self.readable_enabled = on;
        self
    }

    /// Start the writable side of a duplex already finished.
    pub fn writable_enabled(mut self, on: bool) -> Self {
        self.writable_enabled = on;
        self
    }

    pub fn read<F>(mut self, f: F) -> Self
    where
        F: Fn(&Stream, usize) -> StreamResult<()> + Send + Sync + 'static,
    {
        self.hooks.read = Some(Arc::new(f));
        self
    }

    pub fn write<F>(mut self, f: F) -> Self
    where
        F: Fn(&Stream, Chunk, Callback) -> StreamResult<()> + Send + Sync + 'static,
    {
        self.hooks.write = Some(Arc::new(f));
        self
    }

    pub fn final_<F>(mut self, f: F) -> Self
    where
        F: Fn(&Stream, Callback) -> StreamResult<()> + Send + Sync + 'static,
    {
        self.hooks.final_ = Some(Arc::new(f));
        self
    }

    pub fn construct<F>(mut self, f: F) -> Self
    where
        F: Fn(&Stream, Callback) -> StreamResult<()> + Send + Sync + 'static,
    {
        self.hooks.construct = Some(Arc::new(f));
        self
    }

    pub fn destroy<F>(mut self, f: F) -> Self
    where
        F: Fn(&Stream, Option<StreamError>, Callback) -> StreamResult<()> + Send + Sync + 'static,
    {
        self.hooks.destroy = Some(Arc::new(f));
        self
    }

    /// Transform only: produce a last chunk once the writable side ended.
    pub fn flush<F>(mut self, f: F) -> Self
    where
        F: Fn(&Stream) -> StreamResult<Option<Chunk>> + Send + Sync + 'static,
    {
        self.flush = Some(Arc::new(f));
        self
    }

    pub fn build(mut self) -> Stream {
        let is_transform = match self.transform.take() {
            Some(f) => {
                let hooks = transform::hooks(f, self.flush.take());
                self.hooks.write = Some(hooks.write);
                self.hooks.read = Some(hooks.read);
                self.hooks.final_ = Some(hooks.final_);
                true
            }
            None => false,
        };

        let lifecycle = Lifecycle::new(self.emit_close, self.auto_destroy);
        let readable = self.has_readable.then(|| {
            let hwm = self
                .readable_high_water_mark
                .unwrap_or_else(|| get_default_high_water_mark(self.readable_object_mode));
            let mut state = ReadableState::new(self.readable_object_mode, hwm, lifecycle.clone());
            if !self.readable_enabled {
                state.disable();
            }
            if is_transform {
                state.sync = false;
            }
            Mutex::new(state)
        });
        let writable = self.has_writable.then(|| {
            let hwm = self
                .writable_high_water_mark
                .unwrap_or_else(|| get_default_high_water_mark(self.writable_object_mode));
            let mut state = WritableState::new(self.writable_object_mode, hwm, lifecycle.clone());
            if !self.writable_enabled {
                state.disable();
            }
            Mutex::new(state)
        });

        let stream = Stream(Arc::new(Inner {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            events: StreamEvents::new(),
            readable,
            writable,
            hooks: self.hooks,
            slots: Mutex::new(Slots::default()),
            allow_half_open: self.allow_half_open,
        }));

        if stream.has_readable() {
            let s = stream.clone();
            destroy::construct(&stream, move || {
                let need_readable = s.rstate().is_some_and(|r| r.need_readable);
                if need_readable {
                    readable::maybe_read_more(&s);
                }
            });
        }
        if stream.has_writable() {
            let s = stream.clone();
            destroy::construct(&stream, move || {
                let writing = s.wstate().is_some_and(|w| w.writing);
                if !writing {
                    writable::clear_buffer(&s);
                }
                writable::finish_maybe(&s, false);
            });
        }
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{is_duplex_node_stream, is_readable_node_stream, is_writable_node_stream};
    use conduit_runtime::run_until_idle;

    #[test]
    fn test_builder_shapes() {
        let r = Stream::readable().build();
        assert!(r.has_readable() && !r.has_writable());
        assert!(is_readable_node_stream(&r, true));
        assert!(!is_writable_node_stream(&r));

        let w = Stream::writable().build();
        assert!(is_writable_node_stream(&w));
        assert!(!is_readable_node_stream(&w, false));

        let d = Stream::duplex().build();
        assert!(is_duplex_node_stream(&d));
        assert_ne!(r.id(), w.id());
    }

    #[test]
    fn test_default_high_water_marks() {
        let bytes = Stream::readable().build();
        assert_eq!(bytes.readable_high_water_mark(), 65536);

        let objects = Stream::duplex()
            .readable_object_mode(true)
            .writable_high_water_mark(3)
            .build();
        assert_eq!(objects.readable_high_water_mark(), 16);
        assert_eq!(objects.writable_high_water_mark(), 3);
        assert!(objects.readable_object_mode());
        assert!(!objects.writable_object_mode());
    }

    #[test]
    fn test_disabled_side() {
        let d = Stream::duplex().readable_enabled(false).build();
        assert_eq!(StreamLike::readable(&d), Some(false));
        assert!(!is_readable_node_stream(&d, false));
        assert_eq!(StreamLike::writable(&d), Some(true));
    }

    #[test]
    fn test_destroyed_flag_requires_both_sides() {
        let d = Stream::duplex().build();
        assert_eq!(StreamLike::destroyed(&d), Some(false));
        d.destroy(None);
        assert!(d.is_destroyed());
        run_until_idle();
        assert_eq!(d.closed(), Some(true));
    }

    #[test]
    fn test_weak_handle() {
        let s = Stream::readable().build();
        let weak = s.downgrade();
        assert!(weak.upgrade().is_some_and(|u| u.same(&s)));
        drop(s);
        assert!(weak.upgrade().is_none());
    }
}
