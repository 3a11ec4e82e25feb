//! Error types for conduit-stream

use conduit_events::AbortReason;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by streams, the destroy machine, `eos`, `pipeline` and
/// `compose`.
///
/// Cloneable so one failure can be recorded in a state blob and delivered to
/// every callback waiting on it.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// `close` arrived before the expected `end`/`finish`
    #[error("Premature close")]
    PrematureClose,

    /// Cancellation through an abort signal or a forced teardown
    #[error("The operation was aborted")]
    Aborted {
        #[source]
        cause: Option<AbortReason>,
    },

    #[error("The \"{name}\" argument must be {expected}")]
    InvalidArgType {
        name: String,
        expected: &'static str,
    },

    #[error("The argument '{name}' {reason}")]
    InvalidArgValue { name: String, reason: &'static str },

    #[error("The \"{0}\" argument must be specified")]
    MissingArgs(&'static str),

    #[error("Cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),

    #[error("write after end")]
    WriteAfterEnd,

    #[error("Cannot call {0} after a stream was finished")]
    AlreadyFinished(&'static str),

    #[error("stream.push() after EOF")]
    PushAfterEof,

    #[error("stream.unshift() after end event")]
    UnshiftAfterEnd,

    #[error("Callback called multiple times")]
    MultipleCallback,

    #[error("The {0} method is not implemented")]
    NotImplemented(&'static str),

    #[error("May not write null values to stream")]
    NullValues,

    /// Error raised by user code (hooks, transforms)
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Two distinct failures; `errors[0]` is the primary one.
    #[error("{}", .errors.first().map(ToString::to_string).unwrap_or_default())]
    Aggregate { errors: Vec<StreamError> },
}

impl StreamError {
    /// Create a user-level error
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// Create an abort error with the given cause
    pub fn aborted(cause: Option<AbortReason>) -> Self {
        Self::Aborted { cause }
    }

    /// The Node.js error code for this error, if it has one.
    pub fn code(&self) -> Option<&'static str> {
        Some(match self {
            Self::PrematureClose => "ERR_STREAM_PREMATURE_CLOSE",
            Self::Aborted { .. } => "ABORT_ERR",
            Self::InvalidArgType { .. } => "ERR_INVALID_ARG_TYPE",
            Self::InvalidArgValue { .. } => "ERR_INVALID_ARG_VALUE",
            Self::MissingArgs(_) => "ERR_MISSING_ARGS",
            Self::Destroyed(_) => "ERR_STREAM_DESTROYED",
            Self::WriteAfterEnd => "ERR_STREAM_WRITE_AFTER_END",
            Self::AlreadyFinished(_) => "ERR_STREAM_ALREADY_FINISHED",
            Self::PushAfterEof => "ERR_STREAM_PUSH_AFTER_EOF",
            Self::UnshiftAfterEnd => "ERR_STREAM_UNSHIFT_AFTER_END_EVENT",
            Self::MultipleCallback => "ERR_MULTIPLE_CALLBACK",
            Self::NotImplemented(_) => "ERR_METHOD_NOT_IMPLEMENTED",
            Self::NullValues => "ERR_STREAM_NULL_VALUES",
            Self::Aggregate { errors } => return errors.first().and_then(StreamError::code),
            Self::Message(_) | Self::Io(_) => return None,
        })
    }

    pub fn is_premature_close(&self) -> bool {
        matches!(self, Self::PrematureClose)
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Whether both values describe the same failure.
    ///
    /// Errors carrying foreign sources compare by identity, everything else by
    /// code and message.
    pub fn same_as(&self, other: &StreamError) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => Arc::ptr_eq(a, b),
            (Self::Aborted { cause: Some(a) }, Self::Aborted { cause: Some(b) }) => {
                Arc::ptr_eq(a, b)
            }
            (Self::Aggregate { errors: a }, Self::Aggregate { errors: b }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => self.code() == other.code() && self.to_string() == other.to_string(),
        }
    }

    /// Every failure folded into this error, primary first.
    pub fn errors(&self) -> Vec<&StreamError> {
        match self {
            Self::Aggregate { errors } => errors.iter().collect(),
            other => vec![other],
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Result type using StreamError
pub type StreamResult<T> = Result<T, StreamError>;

/// Merge two optional errors, keeping `first` as the primary one.
///
/// If both are present and distinct, the result is an aggregate whose first
/// entry is `first`; an existing aggregate absorbs `second` instead of being
/// nested.
pub fn aggregate_two_errors(
    first: Option<StreamError>,
    second: Option<StreamError>,
) -> Option<StreamError> {
    match (first, second) {
        (Some(first), Some(second)) if !first.same_as(&second) => match first {
            StreamError::Aggregate { mut errors } => {
                errors.push(second);
                Some(StreamError::Aggregate { errors })
            }
            first => Some(StreamError::Aggregate {
                errors: vec![first, second],
            }),
        },
        (first, second) => first.or(second),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            StreamError::PrematureClose.code(),
            Some("ERR_STREAM_PREMATURE_CLOSE")
        );
        assert_eq!(StreamError::aborted(None).code(), Some("ABORT_ERR"));
        assert_eq!(StreamError::msg("boom").code(), None);
        assert_eq!(
            StreamError::Destroyed("write").to_string(),
            "Cannot call write after a stream was destroyed"
        );
    }

    #[test]
    fn test_aggregate_keeps_first() {
        let a = StreamError::msg("a");
        let b = StreamError::msg("b");

        assert!(aggregate_two_errors(None, None).is_none());
        assert_eq!(
            aggregate_two_errors(Some(a.clone()), None).unwrap().to_string(),
            "a"
        );
        assert_eq!(
            aggregate_two_errors(None, Some(b.clone())).unwrap().to_string(),
            "b"
        );

        let merged = aggregate_two_errors(Some(a.clone()), Some(b.clone())).unwrap();
        assert_eq!(merged.to_string(), "a");
        let parts: Vec<String> = merged.errors().iter().map(|e| e.to_string()).collect();
        assert_eq!(parts, vec!["a", "b"]);
    }

    #[test]
    fn test_aggregate_same_error_not_duplicated() {
        let a = StreamError::msg("a");
        let merged = aggregate_two_errors(Some(a.clone()), Some(a)).unwrap();
        assert!(matches!(merged, StreamError::Message(_)));
    }

    #[test]
    fn test_aggregate_absorbs_into_existing() {
        let ab = aggregate_two_errors(Some(StreamError::msg("a")), Some(StreamError::msg("b")));
        let abc = aggregate_two_errors(ab, Some(StreamError::PrematureClose)).unwrap();
        assert_eq!(abc.errors().len(), 3);
        assert_eq!(abc.code(), None);
    }

    #[test]
    fn test_aborted_keeps_cause() {
        use std::error::Error as _;
        let cause: AbortReason = Arc::new(conduit_events::AbortedError);
        let err = StreamError::aborted(Some(cause));
        assert!(err.is_abort());
        assert_eq!(
            err.source().map(|s| s.to_string()).as_deref(),
            Some("This operation was aborted")
        );
    }

    #[test]
    fn test_io_conversion() {
        let err: StreamError = std::io::Error::other("disk").into();
        assert_eq!(err.to_string(), "disk");
        assert!(err.same_as(&err.clone()));
    }
}
