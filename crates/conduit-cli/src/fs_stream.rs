//! File-backed streams for the CLI.

use conduit_stream::{Chunk, Stream, StreamError};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Readable over the file at `path`. The file is opened by the construct
/// hook and closed on destroy.
pub fn file_reader(path: PathBuf, high_water_mark: Option<usize>) -> Stream {
    let file: Arc<Mutex<Option<File>>> = Arc::new(Mutex::new(None));

    let mut builder = Stream::readable();
    if let Some(hwm) = high_water_mark {
        builder = builder.high_water_mark(hwm);
    }

    let slot = file.clone();
    let reader = file.clone();
    builder
        .construct(move |_, cb| {
            match File::open(&path) {
                Ok(f) => {
                    tracing::debug!(path = %path.display(), "opened input");
                    *slot.lock() = Some(f);
                    cb(None);
                }
                Err(err) => cb(Some(err.into())),
            }
            Ok(())
        })
        .read(move |s, size| {
            let mut buf = vec![0; size.max(1)];
            let n = {
                let mut guard = reader.lock();
                let Some(f) = guard.as_mut() else {
                    return Err(StreamError::Destroyed("read"));
                };
                f.read(&mut buf)?
            };
            if n == 0 {
                s.push(None);
            } else {
                buf.truncate(n);
                s.push(Some(Chunk::from(buf)));
            }
            Ok(())
        })
        .destroy(move |_, err, cb| {
            file.lock().take();
            cb(err);
            Ok(())
        })
        .build()
}

/// Writable over whatever `open` returns; opened by the construct hook and
/// flushed by the final hook.
pub fn writer<W, F>(open: F) -> Stream
where
    W: Write + Send + 'static,
    F: Fn() -> std::io::Result<W> + Send + Sync + 'static,
{
    let out: Arc<Mutex<Option<W>>> = Arc::new(Mutex::new(None));

    let slot = out.clone();
    let sink = out.clone();
    let flusher = out.clone();
    Stream::writable()
        .construct(move |_, cb| {
            match open() {
                Ok(w) => {
                    *slot.lock() = Some(w);
                    cb(None);
                }
                Err(err) => cb(Some(err.into())),
            }
            Ok(())
        })
        .write(move |_, chunk, cb| {
            let result = match sink.lock().as_mut() {
                Some(w) => w.write_all(&chunk.to_bytes()),
                None => {
                    cb(Some(StreamError::Destroyed("write")));
                    return Ok(());
                }
            };
            cb(result.err().map(StreamError::from));
            Ok(())
        })
        .final_(move |_, cb| {
            let result = flusher.lock().as_mut().map_or(Ok(()), |w| w.flush());
            cb(result.err().map(StreamError::from));
            Ok(())
        })
        .destroy(move |_, err, cb| {
            out.lock().take();
            cb(err);
            Ok(())
        })
        .build()
}

/// Writable creating (or truncating) the file at `path`.
pub fn file_writer(path: PathBuf) -> Stream {
    writer(move || {
        tracing::debug!(path = %path.display(), "creating output");
        File::create(&path)
    })
}

/// Writable over standard output.
pub fn stdout_writer() -> Stream {
    writer(|| Ok(std::io::stdout()))
}

/// Transform upper-casing ASCII letters.
pub fn upper_case() -> Stream {
    Stream::transform(|_, chunk| Ok(Some(Chunk::from(chunk.to_bytes().to_ascii_uppercase()))))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_runtime::block_on;
    use conduit_stream::{PipelineOptions, Stage, pipeline_async};

    fn run(stages: Vec<Stage>) -> Result<(), StreamError> {
        block_on(pipeline_async(stages, PipelineOptions::default()))
            .unwrap_or(Err(StreamError::PrematureClose))
    }

    #[test]
    fn test_copy_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "hello conduit\n".repeat(100)).unwrap();

        run(vec![
            Stage::from(file_reader(input.clone(), Some(64))),
            Stage::from(file_writer(output.clone())),
        ])
        .unwrap();

        assert_eq!(
            std::fs::read(&input).unwrap(),
            std::fs::read(&output).unwrap()
        );
    }

    #[test]
    fn test_upper_case_copy() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "abc-def").unwrap();

        run(vec![
            Stage::from(file_reader(input, None)),
            Stage::from(upper_case()),
            Stage::from(file_writer(output.clone())),
        ])
        .unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "ABC-DEF");
    }

    #[test]
    fn test_missing_input_fails_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");

        let err = run(vec![
            Stage::from(file_reader(dir.path().join("missing.txt"), None)),
            Stage::from(file_writer(output)),
        ])
        .unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn test_writer_collects_into_buffer() {
        let buf = Arc::new(Mutex::new(Vec::new()));

        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let b = buf.clone();
        let sink = writer(move || Ok(Shared(b.clone())));
        let source = Stream::from_iter(vec![Ok(Chunk::from("ab")), Ok(Chunk::from("cd"))]);
        run(vec![Stage::from(source), Stage::from(sink)]).unwrap();
        assert_eq!(buf.lock().as_slice(), b"abcd");
    }
}
