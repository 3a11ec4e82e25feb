//! Stream pipeline and lifecycle engine for Conduit.
//!
//! This crate provides Node.js-style streams and the machinery that drives
//! their lifecycles.
//!
//! # Modules
//!
//! - `capability` - Classify stream-like objects by what they expose
//! - `destroy` - Construct/destroy state machine, `destroyer`
//! - `eos` - End-of-stream waiter (`eos`, `finished`)
//! - `pipeline` - Connect stages with unified error handling
//! - `compose` - Fold a chain of stages into one duplex
//! - `stream` - Readable, Writable, Duplex, Transform and PassThrough streams
//!
//! # Example
//!
//! ```no_run
//! use conduit_stream::{Stage, Stream, pipeline};
//!
//! let source = Stream::from_iter(vec![Ok("a".into()), Ok("b".into())]);
//! let sink = Stream::writable()
//!     .object_mode(true)
//!     .write(|_, chunk, cb| {
//!         println!("{:?}", chunk.as_str());
//!         cb(None);
//!         Ok(())
//!     })
//!     .build();
//! pipeline(vec![Stage::from(source), Stage::from(sink)], |err| {
//!     assert!(err.is_none());
//! })
//! .unwrap();
//! conduit_runtime::run_until_idle();
//! ```

pub mod abort;
pub mod capability;
pub mod chunk;
pub mod compose;
pub mod config;
pub mod destroy;
pub mod eos;
pub mod error;
pub mod events;
pub mod from;
pub mod once;
pub mod pipeline;
mod readable;
pub mod state;
pub mod stream;
mod transform;
mod writable;

pub use abort::add_abort_signal;
pub use capability::{Capabilities, FinishedOptions, RequestLike, StreamLike};
pub use chunk::Chunk;
pub use compose::compose;
pub use config::{ConfigError, StreamConfig, get_default_high_water_mark, set_default_high_water_mark};
pub use destroy::{destroyer, undestroy};
pub use eos::{Cleanup, EosOptions, eos, finished};
pub use error::{StreamError, StreamResult, aggregate_two_errors};
pub use events::{EventArg, StreamEvents};
pub use from::{ChunkSource, TransformFn};
pub use once::Once;
pub use pipeline::{PipelineOptions, Stage, pipeline, pipeline_async, pipeline_with};
pub use state::{Lifecycle, ReadableView, WritableView};
pub use stream::{Callback, PipeOptions, Stream, StreamBuilder, WeakStream};

// Re-export the abort primitives streams accept
pub use conduit_events::{AbortController, AbortSignal};
