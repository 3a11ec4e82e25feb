//! Duplex composer: one stream writing into the first stage of a pipeline
//! and reading from its last stage.

use crate::capability::{is_readable, is_writable};
use crate::destroy::destroyer;
use crate::error::{StreamError, StreamResult};
use crate::pipeline::{Stage, pipeline};
use crate::stream::{Callback, Stream, WeakStream};
use parking_lot::Mutex;
use std::sync::Arc;

/// Destroy callback parked until the inner pipeline completes.
#[derive(Default)]
enum CloseSlot {
    #[default]
    Running,
    Waiting(Callback),
    Finished,
}

#[derive(Default)]
struct Pending {
    ondrain: Option<Callback>,
    onfinish: Option<Callback>,
    onreadable: bool,
    onclose: CloseSlot,
}

struct Shared {
    pending: Mutex<Pending>,
    duplex: Mutex<Option<WeakStream>>,
    readable: bool,
    writable: bool,
}

impl Shared {
    fn duplex(&self) -> Option<Stream> {
        self.duplex.lock().as_ref().and_then(WeakStream::upgrade)
    }

    /// Completion of the inner pipeline.
    fn on_finished(&self, err: Option<StreamError>) {
        let waiting = {
            let mut p = self.pending.lock();
            match std::mem::replace(&mut p.onclose, CloseSlot::Finished) {
                CloseSlot::Waiting(cb) => Some(cb),
                _ => None,
            }
        };
        tracing::debug!(error = ?err, "composed pipeline finished");
        if let Some(cb) = waiting {
            cb(err);
        } else if let Some(d) = self.duplex() {
            if err.is_some() {
                d.destroy(err);
            } else if !self.readable && !self.writable {
                d.destroy(None);
            }
        }
    }
}

/// Pull from `tail` into `d` until either side says stop.
fn pull(shared: &Shared, d: &Stream, tail: &Stream) {
    loop {
        match tail.read() {
            None => {
                shared.pending.lock().onreadable = true;
                return;
            }
            Some(chunk) => {
                if !d.push(Some(chunk)) {
                    return;
                }
            }
        }
    }
}

/// Combine `stages` into a single duplex.
///
/// Writes go to the first stage and reads come from the last one; the
/// stages are connected with [`pipeline`]. A single stage is returned as a
/// stream on its own.
pub fn compose(stages: Vec<Stage>) -> StreamResult<Stream> {
    if stages.is_empty() {
        return Err(StreamError::MissingArgs("streams"));
    }
    let streams: Vec<Stream> = stages.into_iter().map(Stage::into_stream).collect();
    if streams.len() == 1 {
        return Ok(streams[0].clone());
    }

    let last = streams.len() - 1;
    for (i, s) in streams.iter().enumerate() {
        if i < last && is_readable(s) != Some(true) {
            return Err(StreamError::InvalidArgValue {
                name: format!("streams[{i}]"),
                reason: "must be readable",
            });
        }
        if i > 0 && is_writable(s) != Some(true) {
            return Err(StreamError::InvalidArgValue {
                name: format!("streams[{i}]"),
                reason: "must be writable",
            });
        }
    }

    let head = streams[0].clone();
    let tail = streams[last].clone();
    let shared = Arc::new(Shared {
        pending: Mutex::new(Pending::default()),
        duplex: Mutex::new(None),
        readable: is_readable(&tail) == Some(true),
        writable: is_writable(&head) == Some(true),
    });

    {
        let shared = shared.clone();
        pipeline(
            streams.into_iter().map(Stage::Stream).collect(),
            move |err| shared.on_finished(err),
        )?;
    }

    let mut builder = Stream::duplex()
        .writable_object_mode(head.writable_object_mode())
        .readable_object_mode(tail.readable_object_mode())
        .writable_enabled(shared.writable)
        .readable_enabled(shared.readable);

    if shared.writable {
        let h = head.clone();
        let sh = shared.clone();
        builder = builder.write(move |_, chunk, cb| {
            if h.write(chunk) {
                cb(None);
            } else {
                sh.pending.lock().ondrain = Some(cb);
            }
            Ok(())
        });
        let h = head.clone();
        let sh = shared.clone();
        builder = builder.final_(move |_, cb| {
            h.end();
            sh.pending.lock().onfinish = Some(cb);
            Ok(())
        });

        let sh = shared.clone();
        head.on("drain", move |_| {
            let cb = sh.pending.lock().ondrain.take();
            if let Some(cb) = cb {
                cb(None);
            }
        });
        let sh = shared.clone();
        tail.on("finish", move |_| {
            let cb = sh.pending.lock().onfinish.take();
            if let Some(cb) = cb {
                cb(None);
            }
        });
    }

    if shared.readable {
        let t = tail.clone();
        let sh = shared.clone();
        builder = builder.read(move |d, _| {
            pull(&sh, d, &t);
            Ok(())
        });
    }

    {
        let t = tail.clone();
        let sh = shared.clone();
        builder = builder.destroy(move |_, err, cb| {
            let (err, forward) = {
                let mut p = sh.pending.lock();
                let running = !matches!(p.onclose, CloseSlot::Finished);
                let err = match err {
                    None if running => Some(StreamError::aborted(None)),
                    err => err,
                };
                p.onreadable = false;
                p.ondrain = None;
                p.onfinish = None;
                if running {
                    p.onclose = CloseSlot::Waiting(cb);
                    (err, None)
                } else {
                    (err, Some(cb))
                }
            };
            match forward {
                Some(cb) => cb(err),
                None => destroyer(&t, err),
            }
            Ok(())
        });
    }

    let d = builder.build();
    *shared.duplex.lock() = Some(d.downgrade());

    if shared.readable {
        let sh = shared.clone();
        let t = tail.downgrade();
        tail.on("readable", move |_| {
            let want = std::mem::take(&mut sh.pending.lock().onreadable);
            if !want {
                return;
            }
            if let (Some(d), Some(t)) = (sh.duplex(), t.upgrade()) {
                pull(&sh, &d, &t);
            }
        });
        let sh = shared.clone();
        tail.on("end", move |_| {
            if let Some(d) = sh.duplex() {
                d.push(None);
            }
        });
    }

    tracing::trace!(stream = d.id(), "composed duplex created");
    Ok(d)
}
