//! Wire protocol for the plugin bridge.
//!
//! Every logical connection is multiplexed over one byte transport. The
//! transport is split into length-delimited frames, each carrying one JSON
//! encoded [`Frame`]:
//!
//! ```json
//! {"conn": 3, "body": {"type": "request", "seq": 1, "method": "Read", "params": {"n": 1024}}}
//! ```
//!
//! Connection `0` is the control connection and is open from the start on
//! both sides. Every other connection is opened with `open` by the side that
//! dials it and answered with `accepted` or `refused` by the side that
//! allocated it.

use std::collections::HashMap;
use std::io::SeekFrom;

use reeve_proto::{Message, PipelineStatus, Trigger};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{PluginError, RemoteError};

/// Identifier of a logical connection.
pub type ConnId = u32;

/// The control connection, open for the whole lifetime of the transport.
pub const CONTROL_CONN: ConnId = 0;

/// One frame on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Logical connection the frame belongs to.
    pub conn: ConnId,
    /// Frame contents.
    pub body: FrameBody,
}

impl Frame {
    /// Create a frame.
    #[must_use]
    pub const fn new(conn: ConnId, body: FrameBody) -> Self {
        Self { conn, body }
    }

    /// Encode the frame as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PluginError> {
        serde_json::to_vec(self).map_err(PluginError::from)
    }

    /// Decode a frame from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, PluginError> {
        serde_json::from_slice(bytes).map_err(|e| PluginError::Protocol(format!("invalid frame: {e}")))
    }
}

/// Contents of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    /// Dialer asks to open the connection.
    Open,
    /// Acceptor confirms the connection.
    Accepted,
    /// Acceptor rejects the connection.
    Refused {
        /// Why the connection was refused.
        reason: String,
    },
    /// RPC request.
    Request {
        /// Sequence number, unique per connection.
        seq: u64,
        /// Method name.
        method: String,
        /// Parameters.
        #[serde(default)]
        params: Value,
    },
    /// RPC response.
    Response {
        /// Sequence number of the request being answered.
        seq: u64,
        /// Result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
    /// Either side is done with the connection.
    Close,
}

impl FrameBody {
    /// Create a response from a call outcome.
    #[must_use]
    pub fn response(seq: u64, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(value) => Self::Response {
                seq,
                result: Some(value),
                error: None,
            },
            Err(err) => Self::Response {
                seq,
                result: None,
                error: Some(err),
            },
        }
    }
}

/// Build the frame codec for a transport.
#[must_use]
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

// ─────────────────────────────────────────────────────────────
// Method names
// ─────────────────────────────────────────────────────────────

/// Methods served on the control connection by the plugin.
pub mod methods {
    /// `Name`.
    pub const NAME: &str = "Plugin.Name";
    /// `Register`.
    pub const REGISTER: &str = "Plugin.Register";
    /// `Unregister`.
    pub const UNREGISTER: &str = "Plugin.Unregister";
    /// `Message`.
    pub const MESSAGE: &str = "Plugin.Message";
    /// `Discover`.
    pub const DISCOVER: &str = "Plugin.Discover";
    /// `Resolve`.
    pub const RESOLVE: &str = "Plugin.Resolve";
    /// `Notify`.
    pub const NOTIFY: &str = "Plugin.Notify";
    /// `CLIMethod`.
    pub const CLI_METHOD: &str = "Plugin.CLIMethod";

    /// Callback: push messages to the host.
    pub const NOTIFY_MESSAGES: &str = "Api.NotifyMessages";
    /// Callback: push triggers to the host.
    pub const NOTIFY_TRIGGERS: &str = "Api.NotifyTriggers";
    /// Callback: close.
    pub const API_CLOSE: &str = "Api.Close";

    /// Log provider: open a reader.
    pub const READER: &str = "Logs.Reader";
    /// Log provider: close.
    pub const PROVIDER_CLOSE: &str = "Logs.Close";

    /// Log reader: forward read.
    pub const READ: &str = "Reader.Read";
    /// Log reader: absolute read.
    pub const READ_AT: &str = "Reader.ReadAt";
    /// Log reader: seek.
    pub const SEEK: &str = "Reader.Seek";
    /// Log reader: size query.
    pub const SIZE: &str = "Reader.Size";
    /// Log reader: close.
    pub const READER_CLOSE: &str = "Reader.Close";
}

// ─────────────────────────────────────────────────────────────
// Call payloads
// ─────────────────────────────────────────────────────────────

/// Parameters of `Register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterParams {
    /// Raw plugin settings.
    pub settings: HashMap<String, String>,
    /// Connection serving the host's callback API.
    pub api_conn: ConnId,
}

/// Reference to the log connection attached to a `Notify` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogsRef {
    /// Whether logs are attached.
    pub present: bool,
    /// Connection serving the log provider; `0` when absent.
    #[serde(default)]
    pub conn: ConnId,
}

impl LogsRef {
    /// No logs attached.
    #[must_use]
    pub const fn absent() -> Self {
        Self {
            present: false,
            conn: 0,
        }
    }

    /// Logs served on `conn`.
    #[must_use]
    pub const fn attached(conn: ConnId) -> Self {
        Self { present: true, conn }
    }

    /// The connection to dial, if any.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a reference that names a connection
    /// while claiming no logs are attached, or that names the control
    /// connection.
    pub fn connection(&self) -> Result<Option<ConnId>, PluginError> {
        match (self.present, self.conn) {
            (false, 0) => Ok(None),
            (false, conn) => Err(PluginError::Protocol(format!(
                "logs reference names connection {conn} but is not present"
            ))),
            (true, CONTROL_CONN) => Err(PluginError::Protocol(
                "logs reference names the control connection".to_string(),
            )),
            (true, conn) => Ok(Some(conn)),
        }
    }
}

/// Parameters of `Notify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyParams {
    /// Status without its log provider.
    pub status: PipelineStatus,
    /// Log connection, if any.
    pub logs: LogsRef,
}

/// Parameters of `NotifyMessages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesParams {
    /// Messages pushed by the plugin.
    pub messages: Vec<Message>,
}

/// Parameters of `NotifyTriggers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggersParams {
    /// Triggers pushed by the plugin.
    pub triggers: Vec<Trigger>,
}

/// Reply of `Reader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderReply {
    /// Connection serving the new reader.
    pub conn: ConnId,
}

/// Parameters of `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadParams {
    /// Maximum number of bytes to return.
    pub n: usize,
}

/// Parameters of `ReadAt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAtParams {
    /// Maximum number of bytes to return.
    pub n: usize,
    /// Absolute offset.
    pub offset: u64,
}

/// Reply of `Read` and `ReadAt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReply {
    /// Bytes read.
    #[serde(with = "reeve_proto::encoding::base64_bytes")]
    pub data: Vec<u8>,
}

/// Origin of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Whence {
    /// From the start.
    Start,
    /// From the current position.
    Current,
    /// From the end.
    End,
}

/// Parameters of `Seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekParams {
    /// Offset relative to `whence`.
    pub offset: i64,
    /// Origin.
    pub whence: Whence,
}

impl SeekParams {
    /// Convert to a [`SeekFrom`].
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a negative offset from the start.
    pub fn to_seek_from(self) -> Result<SeekFrom, PluginError> {
        match self.whence {
            Whence::Start => u64::try_from(self.offset)
                .map(SeekFrom::Start)
                .map_err(|_| PluginError::Protocol(format!("negative start offset {}", self.offset))),
            Whence::Current => Ok(SeekFrom::Current(self.offset)),
            Whence::End => Ok(SeekFrom::End(self.offset)),
        }
    }
}

impl TryFrom<SeekFrom> for SeekParams {
    type Error = PluginError;

    fn try_from(pos: SeekFrom) -> Result<Self, Self::Error> {
        Ok(match pos {
            SeekFrom::Start(offset) => Self {
                offset: i64::try_from(offset)
                    .map_err(|_| PluginError::Protocol(format!("start offset {offset} out of range")))?,
                whence: Whence::Start,
            },
            SeekFrom::Current(offset) => Self {
                offset,
                whence: Whence::Current,
            },
            SeekFrom::End(offset) => Self {
                offset,
                whence: Whence::End,
            },
        })
    }
}

/// Reply of `Seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekReply {
    /// New absolute position.
    pub position: u64,
}

/// Reply of `Size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeReply {
    /// Current size in bytes.
    pub size: i64,
    /// Whether the writer has closed the stream.
    pub closed: bool,
}
