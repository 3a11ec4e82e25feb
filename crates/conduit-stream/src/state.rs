//! Per-direction state blobs.
//!
//! A Duplex carries one [`ReadableState`] and one [`WritableState`]; the
//! lifecycle bits of the two directions are tracked independently and kept
//! in step by the destroy machine.

use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::stream::{Callback, Stream};
use std::collections::{HashSet, VecDeque};

/// Lifecycle bits shared by both directions.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    pub constructed: bool,
    pub destroyed: bool,
    pub closed: bool,
    pub close_emitted: bool,
    pub errored: Option<StreamError>,
    pub error_emitted: bool,
    pub emit_close: bool,
    pub auto_destroy: bool,
}

impl Lifecycle {
    pub fn new(emit_close: bool, auto_destroy: bool) -> Self {
        Self {
            constructed: true,
            emit_close,
            auto_destroy,
            ..Default::default()
        }
    }

    /// Record `err` unless an earlier error is already recorded.
    pub(crate) fn record_error(&mut self, err: &StreamError) {
        if self.errored.is_none() {
            self.errored = Some(err.clone());
        }
    }
}

/// Read-only snapshot of a readable direction.
#[derive(Debug, Clone, Default)]
pub struct ReadableView {
    pub lifecycle: Lifecycle,
    /// `false` when the direction was disabled at construction
    pub readable: bool,
    pub object_mode: bool,
    pub high_water_mark: usize,
    pub length: usize,
    pub flowing: Option<bool>,
    pub ended: bool,
    pub end_emitted: bool,
    pub reading: bool,
}

/// Read-only snapshot of a writable direction.
#[derive(Debug, Clone, Default)]
pub struct WritableView {
    pub lifecycle: Lifecycle,
    /// `false` when the direction was disabled at construction
    pub writable: bool,
    pub object_mode: bool,
    pub high_water_mark: usize,
    pub length: usize,
    pub ending: bool,
    pub ended: bool,
    pub finished: bool,
    pub need_drain: bool,
    pub writing: bool,
    pub corked: bool,
}

pub(crate) struct ReadableState {
    pub lifecycle: Lifecycle,
    pub readable: bool,
    pub object_mode: bool,
    pub high_water_mark: usize,
    pub buffer: VecDeque<Chunk>,
    pub length: usize,
    pub pipes: Vec<Stream>,
    pub flowing: Option<bool>,
    pub ended: bool,
    pub end_emitted: bool,
    pub reading: bool,
    /// Set while the read hook runs (or until the first read)
    pub sync: bool,
    pub need_readable: bool,
    pub emitted_readable: bool,
    pub readable_listening: bool,
    pub resume_scheduled: bool,
    pub paused: Option<bool>,
    pub data_emitted: bool,
    pub reading_more: bool,
    /// Pipe destinations (by stream id) whose `write` returned false
    pub await_drain_writers: HashSet<u64>,
}

impl ReadableState {
    pub fn new(object_mode: bool, high_water_mark: usize, lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            readable: true,
            object_mode,
            high_water_mark,
            buffer: VecDeque::new(),
            length: 0,
            pipes: Vec::new(),
            flowing: None,
            ended: false,
            end_emitted: false,
            reading: false,
            sync: true,
            need_readable: false,
            emitted_readable: false,
            readable_listening: false,
            resume_scheduled: false,
            paused: None,
            data_emitted: false,
            reading_more: false,
            await_drain_writers: HashSet::new(),
        }
    }

    /// Direction switched off: behaves as an already-ended readable.
    pub fn disable(&mut self) {
        self.readable = false;
        self.ended = true;
        self.end_emitted = true;
    }

    pub fn view(&self) -> ReadableView {
        ReadableView {
            lifecycle: self.lifecycle.clone(),
            readable: self.readable,
            object_mode: self.object_mode,
            high_water_mark: self.high_water_mark,
            length: self.length,
            flowing: self.flowing,
            ended: self.ended,
            end_emitted: self.end_emitted,
            reading: self.reading,
        }
    }
}

/// A write waiting for the current one to complete.
pub(crate) struct PendingWrite {
    pub chunk: Chunk,
    pub callback: Callback,
}

pub(crate) struct WritableState {
    pub lifecycle: Lifecycle,
    pub writable: bool,
    pub object_mode: bool,
    pub high_water_mark: usize,
    pub length: usize,
    pub writing: bool,
    /// Set while the write/final hook runs
    pub sync: bool,
    pub ending: bool,
    pub ended: bool,
    pub finished: bool,
    pub need_drain: bool,
    pub corked: u32,
    pub buffer_processing: bool,
    pub buffered: VecDeque<PendingWrite>,
    pub pending_cb: usize,
    pub write_len: usize,
    /// User callback of the in-flight write
    pub write_cb: Option<Callback>,
    pub prefinished: bool,
    pub final_called: bool,
    pub on_finished: Vec<Callback>,
}

impl WritableState {
    pub fn new(object_mode: bool, high_water_mark: usize, lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            writable: true,
            object_mode,
            high_water_mark,
            length: 0,
            writing: false,
            sync: true,
            ending: false,
            ended: false,
            finished: false,
            need_drain: false,
            corked: 0,
            buffer_processing: false,
            buffered: VecDeque::new(),
            pending_cb: 0,
            write_len: 0,
            write_cb: None,
            prefinished: false,
            final_called: false,
            on_finished: Vec::new(),
        }
    }

    /// Direction switched off: behaves as an already-finished writable.
    pub fn disable(&mut self) {
        self.writable = false;
        self.ending = true;
        self.ended = true;
        self.finished = true;
    }

    /// All conditions for emitting `finish` hold.
    pub fn need_finish(&self) -> bool {
        self.ending
            && !self.lifecycle.destroyed
            && self.lifecycle.constructed
            && self.length == 0
            && self.lifecycle.errored.is_none()
            && self.buffered.is_empty()
            && !self.finished
            && !self.writing
            && !self.lifecycle.error_emitted
            && !self.lifecycle.close_emitted
    }

    pub fn view(&self) -> WritableView {
        WritableView {
            lifecycle: self.lifecycle.clone(),
            writable: self.writable,
            object_mode: self.object_mode,
            high_water_mark: self.high_water_mark,
            length: self.length,
            ending: self.ending,
            ended: self.ended,
            finished: self.finished,
            need_drain: self.need_drain,
            writing: self.writing,
            corked: self.corked > 0,
        }
    }
}
