//! Bridge configuration.

use std::collections::HashSet;
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::handshake::HandshakeConfig;

/// Default maximum frame size: 16MB.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Default maximum chunk served per log read: 1MB.
pub const DEFAULT_MAX_READ_CHUNK: usize = 1024 * 1024;

/// Environment variable overriding the dial timeout, in milliseconds.
pub const DIAL_TIMEOUT_ENV: &str = "REEVE_PLUGIN_DIAL_TIMEOUT_MS";

/// Environment variable overriding the accept timeout, in milliseconds.
pub const ACCEPT_TIMEOUT_ENV: &str = "REEVE_PLUGIN_ACCEPT_TIMEOUT_MS";

/// Environment variable overriding the maximum log read chunk, in bytes.
pub const MAX_READ_CHUNK_ENV: &str = "REEVE_PLUGIN_MAX_READ_CHUNK";

/// Read `name` from the environment and parse it, falling back to `default`
/// when the variable is unset or does not parse.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a boolean flag from the environment.
///
/// Accepts `true`/`false`, `1`/`0`, `yes`/`no` and `on`/`off` in any case.
pub fn bool_env_or(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(default)
}

/// Read a whitespace-separated set of fields from the environment, falling
/// back to the fields of `default` when the variable is unset or empty.
pub fn env_fields(name: &str, default: &str) -> HashSet<String> {
    let value = env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    split_fields(&value)
}

fn split_fields(value: &str) -> HashSet<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration for a connection broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Maximum size of one frame on the transport.
    pub max_frame_length: usize,
    /// Capacity of the outbound frame queue.
    pub channel_buffer: usize,
    /// How long a dial waits for the peer to accept.
    pub dial_timeout: Duration,
    /// How long an acceptor waits for the peer to dial before giving up.
    pub accept_timeout: Duration,
    /// Maximum number of bytes a log reader server returns per read.
    pub max_read_chunk: usize,
}

impl BrokerConfig {
    /// Create a broker configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            dial_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(30),
            max_read_chunk: DEFAULT_MAX_READ_CHUNK,
        }
    }

    /// Defaults overridden by the `REEVE_PLUGIN_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::new();
        Self {
            dial_timeout: Duration::from_millis(env_or(
                DIAL_TIMEOUT_ENV,
                defaults.dial_timeout.as_millis() as u64,
            )),
            accept_timeout: Duration::from_millis(env_or(
                ACCEPT_TIMEOUT_ENV,
                defaults.accept_timeout.as_millis() as u64,
            )),
            max_read_chunk: env_or(MAX_READ_CHUNK_ENV, defaults.max_read_chunk),
            ..defaults
        }
    }

    /// Set the maximum frame length.
    #[must_use]
    pub const fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = length;
        self
    }

    /// Set the channel buffer size.
    #[must_use]
    pub const fn with_channel_buffer(mut self, size: usize) -> Self {
        self.channel_buffer = size;
        self
    }

    /// Set the dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the accept timeout.
    #[must_use]
    pub const fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the maximum read chunk.
    #[must_use]
    pub const fn with_max_read_chunk(mut self, size: usize) -> Self {
        self.max_read_chunk = size;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for launching a plugin process from the host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Plugin executable.
    pub program: PathBuf,
    /// Arguments passed to the plugin.
    pub args: Vec<String>,
    /// Handshake expectations.
    pub handshake: HandshakeConfig,
    /// How long to wait for the handshake line.
    pub startup_timeout: Duration,
    /// How long to wait for the plugin to exit before killing it.
    pub shutdown_grace: Duration,
    /// Broker settings for the connection to the plugin.
    pub broker: BrokerConfig,
}

impl HostConfig {
    /// Create a host configuration for the given executable.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            handshake: HandshakeConfig::default(),
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            broker: BrokerConfig::from_env(),
        }
    }

    /// Add an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the handshake configuration.
    #[must_use]
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Set the startup timeout.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the broker configuration.
    #[must_use]
    pub const fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }
}

/// Configuration for serving a plugin inside the plugin process.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Handshake expectations.
    pub handshake: HandshakeConfig,
    /// Address to listen on for the host.
    pub bind_addr: SocketAddr,
    /// How long to wait for the host to connect.
    pub accept_timeout: Duration,
    /// Broker settings for the connection to the host.
    pub broker: BrokerConfig,
}

impl ServeConfig {
    /// Create a serve configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            accept_timeout: Duration::from_secs(30),
            broker: BrokerConfig::from_env(),
        }
    }

    /// Set the handshake configuration.
    #[must_use]
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Set the bind address.
    #[must_use]
    pub const fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the accept timeout.
    #[must_use]
    pub const fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the broker configuration.
    #[must_use]
    pub const fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self::new()
    }
}
