//! Messages exchanged between the host and plugins.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Target addressing every plugin.
pub const BROADCAST_TARGET: &str = "*";

/// Source string reserved for the host itself.
pub const SOURCE_SERVER: &str = "*server";

/// Source string reserved for the host's public API.
pub const SOURCE_API: &str = "*api";

/// Content dispatched to plugins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    /// Receiving plugin name, or [`BROADCAST_TARGET`].
    pub target: String,
    /// Free-form options.
    pub options: HashMap<String, String>,
    /// Payload.
    #[serde(with = "crate::encoding::base64_bytes")]
    pub data: Vec<u8>,
}

impl Message {
    /// Create a message for a single target.
    #[must_use]
    pub fn new(target: impl Into<String>, options: HashMap<String, String>, data: Vec<u8>) -> Self {
        Self {
            target: target.into(),
            options,
            data,
        }
    }

    /// Create a message addressed to every plugin.
    #[must_use]
    pub fn broadcast(options: HashMap<String, String>, data: Vec<u8>) -> Self {
        Self::new(BROADCAST_TARGET, options, data)
    }

    /// Returns true if the message is addressed to every plugin.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST_TARGET
    }
}

/// Where a message came from.
///
/// Serialized as a plain string so that host sentinels and plugin names share
/// one field on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageSource {
    /// The host itself.
    Server,
    /// The host's public API.
    Api,
    /// A plugin, by name.
    Plugin(String),
}

impl MessageSource {
    /// Returns true if the message was produced by a plugin.
    #[must_use]
    pub const fn is_from_plugin(&self) -> bool {
        matches!(self, Self::Plugin(_))
    }

    /// The wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Server => SOURCE_SERVER,
            Self::Api => SOURCE_API,
            Self::Plugin(name) => name,
        }
    }
}

impl From<String> for MessageSource {
    fn from(source: String) -> Self {
        match source.as_str() {
            SOURCE_SERVER => Self::Server,
            SOURCE_API => Self::Api,
            _ => Self::Plugin(source),
        }
    }
}

impl From<&str> for MessageSource {
    fn from(source: &str) -> Self {
        Self::from(source.to_string())
    }
}

impl From<MessageSource> for String {
    fn from(source: MessageSource) -> Self {
        match source {
            MessageSource::Plugin(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message together with its source, as carried by `Message` calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullMessage {
    /// The message.
    pub message: Message,
    /// Who sent it.
    pub source: MessageSource,
}

impl FullMessage {
    /// Pair a message with its source.
    #[must_use]
    pub const fn new(source: MessageSource, message: Message) -> Self {
        Self { message, source }
    }
}
