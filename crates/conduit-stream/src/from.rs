//! Adapters turning iterators and functions into streams.

use crate::chunk::Chunk;
use crate::error::{StreamError, StreamResult};
use crate::stream::Stream;
use parking_lot::Mutex;
use std::sync::Arc;

/// Fallible source of chunks.
pub type ChunkSource = Box<dyn Iterator<Item = StreamResult<Chunk>> + Send>;

/// Maps one chunk to at most one chunk.
pub type TransformFn = Arc<dyn Fn(Chunk) -> StreamResult<Option<Chunk>> + Send + Sync>;

impl Stream {
    /// An object-mode readable yielding every item of `iter`.
    ///
    /// An `Err` item destroys the stream with that error; a JSON `null`
    /// item is rejected because it would read as end-of-stream.
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<I>(iter: I) -> Stream
    where
        I: IntoIterator<Item = StreamResult<Chunk>>,
        I::IntoIter: Send + 'static,
    {
        from_source(Box::new(iter.into_iter()))
    }

    /// An object-mode transform applying `f` to every chunk.
    pub fn from_fn(f: TransformFn) -> Stream {
        Stream::transform(move |_, chunk| f(chunk))
            .object_mode(true)
            .build()
    }
}

pub(crate) fn from_source(source: ChunkSource) -> Stream {
    let source = Arc::new(Mutex::new(Some(source)));
    let on_destroy = source.clone();
    Stream::readable()
        .object_mode(true)
        .high_water_mark(1)
        .read(move |stream, _| {
            loop {
                let next = match source.lock().as_mut() {
                    Some(iter) => iter.next(),
                    None => return Ok(()),
                };
                match next {
                    None => {
                        source.lock().take();
                        stream.push(None);
                        return Ok(());
                    }
                    Some(Err(err)) => {
                        source.lock().take();
                        stream.destroy(Some(err));
                        return Ok(());
                    }
                    Some(Ok(Chunk::Json(serde_json::Value::Null))) => {
                        source.lock().take();
                        return Err(StreamError::NullValues);
                    }
                    Some(Ok(chunk)) => {
                        if !stream.push(Some(chunk)) {
                            return Ok(());
                        }
                    }
                }
            }
        })
        .destroy(move |_, err, cb| {
            on_destroy.lock().take();
            cb(err);
            Ok(())
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_runtime::run_until_idle;
    use serde_json::json;

    fn drain(stream: &Stream) -> (Arc<Mutex<Vec<serde_json::Value>>>, Arc<Mutex<Option<String>>>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        let error = Arc::new(Mutex::new(None));
        let i = items.clone();
        stream.on("data", move |arg| {
            if let Some(chunk) = arg.chunk() {
                i.lock().push(chunk.to_json());
            }
        });
        let e = error.clone();
        stream.on("error", move |arg| *e.lock() = arg.error().map(ToString::to_string));
        (items, error)
    }

    #[test]
    fn test_from_iter_yields_all_items() {
        let s = Stream::from_iter((1..=3).map(|n| Ok(Chunk::from(json!(n)))));
        let (items, error) = drain(&s);
        let ended = Arc::new(Mutex::new(false));
        let e = ended.clone();
        s.on("end", move |_| *e.lock() = true);
        run_until_idle();
        assert_eq!(*items.lock(), vec![json!(1), json!(2), json!(3)]);
        assert!(error.lock().is_none());
        assert!(*ended.lock());
    }

    #[test]
    fn test_from_iter_error_destroys() {
        let s = Stream::from_iter(vec![
            Ok(Chunk::from(json!("a"))),
            Err(StreamError::msg("source failed")),
        ]);
        let (items, error) = drain(&s);
        run_until_idle();
        assert_eq!(*items.lock(), vec![json!("a")]);
        assert_eq!(error.lock().as_deref(), Some("source failed"));
        assert!(s.is_destroyed());
    }

    #[test]
    fn test_from_iter_rejects_null() {
        let s = Stream::from_iter(vec![Ok(Chunk::from(serde_json::Value::Null))]);
        let (_, error) = drain(&s);
        run_until_idle();
        assert_eq!(
            error.lock().as_deref(),
            Some("May not write null values to stream")
        );
    }

    #[test]
    fn test_from_fn_maps() {
        let double: TransformFn = Arc::new(|chunk| {
            Ok(chunk.to_json().as_i64().map(|n| Chunk::from(json!(n * 2))))
        });
        let t = Stream::from_fn(double);
        let (items, _) = drain(&t);
        t.write(json!(2));
        t.write(json!("skip"));
        t.write(json!(5));
        t.end();
        run_until_idle();
        assert_eq!(*items.lock(), vec![json!(4), json!(10)]);
    }
}
