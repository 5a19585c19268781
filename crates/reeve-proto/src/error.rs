//! Error types for the reeve-proto crate.

use thiserror::Error;

/// Canonical text of the end-of-stream condition.
///
/// Peers that cannot carry an error kind still agree on this message.
pub const EOF_MESSAGE: &str = "EOF";

/// Canonical text of the "not available" condition.
pub const UNAVAILABLE_MESSAGE: &str = "not available";

/// Errors that can occur while handling protocol data.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a value.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a value.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decoding(err.to_string())
    }
}

/// Errors returned by log readers and log reader providers.
///
/// `Eof` and `Unavailable` are sentinel conditions: callers match on them
/// rather than on the message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The reader reached the end of a closed stream.
    #[error("EOF")]
    Eof,

    /// No logs can currently be produced.
    #[error("not available")]
    Unavailable,

    /// The reader or provider has been closed.
    #[error("stream closed")]
    Closed,

    /// A seek resolved to a negative or overflowing position.
    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    /// The connection carrying the stream failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl StreamError {
    /// Returns true for the end-of-stream sentinel.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}
