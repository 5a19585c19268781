//! Process handshake.
//!
//! The host starts a plugin with the magic cookie set in its environment.
//! The plugin checks the cookie, starts listening, and announces itself
//! with one line on stdout:
//!
//! ```text
//! 1|reeveci|tcp|127.0.0.1:40123
//! ```
//!
//! The fields are the protocol version, the cookie value, the network and
//! the address to connect to.

use std::fmt;
use std::str::FromStr;

use crate::error::{PluginError, PluginResult};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the magic cookie.
pub const MAGIC_COOKIE_KEY: &str = "REEVE_PLUGIN";

/// Expected magic cookie value.
pub const MAGIC_COOKIE_VALUE: &str = "reeveci";

/// The only network plugins listen on.
pub const NETWORK_TCP: &str = "tcp";

/// Handshake expectations shared by host and plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Protocol version.
    pub protocol_version: u32,
    /// Environment variable carrying the cookie.
    pub magic_cookie_key: String,
    /// Expected cookie value.
    pub magic_cookie_value: String,
}

impl HandshakeConfig {
    /// The Reeve handshake.
    #[must_use]
    pub fn new() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            magic_cookie_key: MAGIC_COOKIE_KEY.to_string(),
            magic_cookie_value: MAGIC_COOKIE_VALUE.to_string(),
        }
    }

    /// Set the protocol version.
    #[must_use]
    pub const fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the cookie variable and value.
    #[must_use]
    pub fn with_magic_cookie(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.magic_cookie_key = key.into();
        self.magic_cookie_value = value.into();
        self
    }

    /// Check the cookie found in the plugin's environment.
    ///
    /// # Errors
    ///
    /// Returns a handshake error when the cookie is missing or wrong, which
    /// means the binary was not started by a Reeve host.
    pub fn check_cookie(&self, value: Option<&str>) -> PluginResult<()> {
        match value {
            Some(value) if value == self.magic_cookie_value => Ok(()),
            _ => Err(PluginError::Handshake(format!(
                "this binary is a Reeve plugin and is not meant to be executed directly \
                 (expected {} in the environment)",
                self.magic_cookie_key
            ))),
        }
    }

    /// The line a plugin listening on `address` announces.
    #[must_use]
    pub fn line(&self, network: impl Into<String>, address: impl Into<String>) -> HandshakeLine {
        HandshakeLine {
            protocol_version: self.protocol_version,
            cookie: self.magic_cookie_value.clone(),
            network: network.into(),
            address: address.into(),
        }
    }

    /// Check a line announced by a plugin.
    ///
    /// # Errors
    ///
    /// Returns a handshake error on a version or cookie mismatch.
    pub fn verify(&self, line: &HandshakeLine) -> PluginResult<()> {
        if line.protocol_version != self.protocol_version {
            return Err(PluginError::Handshake(format!(
                "incompatible protocol version {} (expected {})",
                line.protocol_version, self.protocol_version
            )));
        }
        if line.cookie != self.magic_cookie_value {
            return Err(PluginError::Handshake("magic cookie mismatch".to_string()));
        }
        Ok(())
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The line a plugin writes to stdout once it is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    /// Protocol version.
    pub protocol_version: u32,
    /// Magic cookie value.
    pub cookie: String,
    /// Network, `tcp`.
    pub network: String,
    /// Address to connect to.
    pub address: String,
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.protocol_version, self.cookie, self.network, self.address
        )
    }
}

impl FromStr for HandshakeLine {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split('|').collect();
        let [version, cookie, network, address] = fields.as_slice() else {
            return Err(PluginError::Handshake(format!(
                "malformed handshake line: {s:?}"
            )));
        };
        let protocol_version = version
            .parse()
            .map_err(|_| PluginError::Handshake(format!("invalid protocol version: {version:?}")))?;
        if address.is_empty() {
            return Err(PluginError::Handshake("handshake line has no address".to_string()));
        }
        Ok(Self {
            protocol_version,
            cookie: (*cookie).to_string(),
            network: (*network).to_string(),
            address: (*address).to_string(),
        })
    }
}
