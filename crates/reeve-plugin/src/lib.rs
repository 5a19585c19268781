//! # reeve-plugin
//!
//! Out-of-process plugins for the Reeve CI/CD orchestrator.
//!
//! A plugin runs as a separate process. This crate turns the [`Plugin`]
//! operations into calls across that process boundary:
//!
//! - [`Broker`] multiplexes logical connections over the one transport
//!   opened at launch
//! - [`PluginClient`] presents the plugin process to the host as a local
//!   [`Plugin`]; [`PluginServer`] exposes a local plugin to the host
//! - the callback API ([`ReeveApi`]) lets a registered plugin push messages
//!   and triggers back to the host
//! - the log bridge lets a plugin read live pipeline logs incrementally,
//!   one connection per provider and per reader
//!
//! ## Launching and serving
//!
//! - [`PluginProcess::launch`]: host side, starts the plugin and completes
//!   the handshake
//! - [`serve`]: plugin side, answers the handshake and serves the plugin

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod host;
pub mod logs;
pub mod plugin;
pub mod protocol;
pub mod rpc;
pub mod serve;
pub mod server;
pub mod stream;

pub use broker::{Broker, ServiceHandle, Side};
pub use callback::{ApiClient, ApiServer, ReeveApi};
pub use client::PluginClient;
pub use config::{BrokerConfig, HostConfig, ServeConfig, bool_env_or, env_fields, env_or};
pub use error::{ErrorKind, PluginError, PluginResult, RemoteError};
pub use handshake::{HandshakeConfig, HandshakeLine};
pub use host::PluginProcess;
pub use logs::{LogReaderClient, LogReaderProviderClient, LogReaderProviderServer, LogReaderServer};
pub use plugin::Plugin;
pub use protocol::{CONTROL_CONN, ConnId, LogsRef};
pub use rpc::{Dispatch, RpcClient, Service};
pub use serve::{serve, serve_transport};
pub use server::PluginServer;
pub use stream::{LogStream, StreamProvider, StreamReader};

pub use reeve_proto;
