//! Error types for the plugin bridge.

use reeve_proto::StreamError;
use reeve_proto::error::{EOF_MESSAGE, UNAVAILABLE_MESSAGE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an error carried in a failed response.
///
/// Sentinel conditions travel as a kind so that the receiving side can
/// restore them without comparing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// End of stream.
    Eof,
    /// Resource not available.
    Unavailable,
    /// Operation not implemented by the plugin.
    NotImplemented,
    /// Malformed or unexpected payload.
    Protocol,
    /// Any other error produced by the remote side's own logic.
    Domain,
}

/// An error as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Create a remote error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a domain error.
    #[must_use]
    pub fn domain(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Domain, message)
    }

    /// Create a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Returns true if this error stands for end-of-stream.
    ///
    /// Peers that only carry text send a domain error with the canonical
    /// message; both encodings are accepted.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.kind == ErrorKind::Eof || (self.kind == ErrorKind::Domain && self.message == EOF_MESSAGE)
    }

    /// Returns true if this error stands for "not available".
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.kind == ErrorKind::Unavailable
            || (self.kind == ErrorKind::Domain && self.message == UNAVAILABLE_MESSAGE)
    }
}

/// Errors that can occur in plugin bridge operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Logical connection or transport failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Plugin process handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Failed to serialize or deserialize a payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The plugin does not implement the operation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The requested resource is not available.
    #[error("not available")]
    Unavailable,

    /// End of stream.
    #[error("EOF")]
    Eof,

    /// Error produced by the remote side's own logic.
    #[error("{0}")]
    Remote(String),

    /// Log stream error.
    #[error("stream error: {0}")]
    Stream(StreamError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Restore a local error from its wire form.
    #[must_use]
    pub fn from_remote(err: RemoteError) -> Self {
        if err.is_eof() {
            return Self::Eof;
        }
        if err.is_unavailable() {
            return Self::Unavailable;
        }
        match err.kind {
            ErrorKind::NotImplemented => Self::NotImplemented(err.message),
            ErrorKind::Protocol => Self::Protocol(err.message),
            _ => Self::Remote(err.message),
        }
    }

    /// The wire form of this error.
    #[must_use]
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Eof | Self::Stream(StreamError::Eof) => RemoteError::new(ErrorKind::Eof, EOF_MESSAGE),
            Self::Unavailable | Self::Stream(StreamError::Unavailable) => {
                RemoteError::new(ErrorKind::Unavailable, UNAVAILABLE_MESSAGE)
            }
            Self::NotImplemented(op) => RemoteError::new(ErrorKind::NotImplemented, op.clone()),
            Self::Protocol(msg) => RemoteError::protocol(msg.clone()),
            Self::Remote(msg) => RemoteError::domain(msg.clone()),
            other => RemoteError::domain(other.to_string()),
        }
    }

    /// Returns true for the end-of-stream sentinel.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Eof | Self::Stream(StreamError::Eof))
    }

    /// Returns true if the error came from the transport rather than the peer.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_))
    }
}

impl From<RemoteError> for PluginError {
    fn from(err: RemoteError) -> Self {
        Self::from_remote(err)
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<StreamError> for PluginError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Eof => Self::Eof,
            StreamError::Unavailable => Self::Unavailable,
            other => Self::Stream(other),
        }
    }
}

impl From<PluginError> for StreamError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Eof => Self::Eof,
            PluginError::Unavailable => Self::Unavailable,
            PluginError::Stream(inner) => inner,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Result type for plugin bridge operations.
pub type PluginResult<T> = Result<T, PluginError>;
