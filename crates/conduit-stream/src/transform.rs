//! Transform and PassThrough: a duplex whose readable side is fed by
//! mapping every written chunk.

use crate::stream::{Callback, FinalHook, FlushHook, ReadHook, Stream, TransformHook, WriteHook};
use conduit_runtime::next_tick;
use parking_lot::Mutex;
use std::sync::Arc;

/// The duplex hooks a transform is built from.
pub(crate) struct TransformHooks {
    pub write: WriteHook,
    pub read: ReadHook,
    pub final_: FinalHook,
}

/// Build the write/read/final hooks implementing a transform.
///
/// A write callback is held back while the readable buffer is above its
/// high-water mark and released by the next read.
pub(crate) fn hooks(f: TransformHook, flush: Option<FlushHook>) -> TransformHooks {
    let pending: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(None));

    let write: WriteHook = {
        let pending = pending.clone();
        Arc::new(move |stream: &Stream, chunk, cb: Callback| {
            let before = stream.readable_length();
            let out = match f(stream, chunk) {
                Ok(out) => out,
                Err(err) => {
                    cb(Some(err));
                    return Ok(());
                }
            };
            if let Some(out) = out {
                stream.push(Some(out));
            }

            let (r_ended, r_len, r_hwm) = match stream.rstate() {
                Some(r) => (r.ended, r.length, r.high_water_mark),
                None => (true, 0, 0),
            };
            let w_ended = stream.wstate().is_some_and(|w| w.ended);
            if r_ended {
                next_tick(move || cb(None));
            } else if w_ended || before == r_len || r_len < r_hwm {
                cb(None);
            } else {
                *pending.lock() = Some(cb);
            }
            Ok(())
        })
    };

    let read: ReadHook = Arc::new(move |_: &Stream, _| {
        let cb = pending.lock().take();
        if let Some(cb) = cb {
            cb(None);
        }
        Ok(())
    });

    let final_: FinalHook = Arc::new(move |stream: &Stream, cb: Callback| {
        if let Some(flush) = flush.as_ref().filter(|_| !stream.is_destroyed()) {
            match flush(stream) {
                Ok(Some(out)) => {
                    stream.push(Some(out));
                }
                Ok(None) => {}
                Err(err) => {
                    cb(Some(err));
                    return Ok(());
                }
            }
        }
        stream.push(None);
        cb(None);
        Ok(())
    });

    TransformHooks {
        write,
        read,
        final_,
    }
}
