//! Plugin-side service adapter.
//!
//! [`PluginServer`] answers the host's control calls by invoking a local
//! [`Plugin`], dialing the callback and log connections the host offers.

use std::sync::Arc;

use async_trait::async_trait;
use reeve_proto::{Capabilities, FullMessage, LogReaderProvider, NoLogs, Trigger};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::broker::Broker;
use crate::callback::{ApiClient, ReeveApi};
use crate::error::{PluginError, PluginResult, RemoteError};
use crate::logs::LogReaderProviderClient;
use crate::plugin::Plugin;
use crate::protocol::{NotifyParams, RegisterParams, methods};
use crate::rpc::{Dispatch, Service, parse_params, to_json, unknown_method};

/// Serves a local plugin on the control connection.
pub struct PluginServer {
    plugin: Arc<dyn Plugin>,
    broker: Broker,
}

impl PluginServer {
    /// Serve `plugin`, dialing callback and log connections on `broker`.
    #[must_use]
    pub fn new(plugin: Arc<dyn Plugin>, broker: Broker) -> Self {
        Self { plugin, broker }
    }

    async fn register(&self, params: RegisterParams) -> PluginResult<Capabilities> {
        // without a callback connection the plugin is never registered
        let client = self.broker.dial(params.api_conn).await?;
        debug!(conn = params.api_conn, "dialed callback API");
        let api: Arc<dyn ReeveApi> = Arc::new(ApiClient::new(client));
        self.plugin.register(params.settings, api).await
    }

    async fn notify(&self, params: NotifyParams) -> PluginResult<()> {
        let NotifyParams { mut status, logs } = params;
        let provider: Arc<dyn LogReaderProvider> = match logs.connection()? {
            Some(conn) => {
                let client = self.broker.dial(conn).await?;
                debug!(conn, "dialed log provider");
                Arc::new(LogReaderProviderClient::new(client, self.broker.clone()))
            }
            None => Arc::new(NoLogs),
        };
        status.logs = Some(provider);
        self.plugin.notify(status).await
    }

    async fn cli_method(&self, flat: Vec<String>) -> PluginResult<String> {
        let mut parts = flat.into_iter();
        let Some(method) = parts.next() else {
            return Err(PluginError::Protocol(
                "CLIMethod needs a method name".to_string(),
            ));
        };
        self.plugin.cli_method(method, parts.collect()).await
    }
}

fn reply<T: Serialize>(result: PluginResult<T>) -> Result<Value, RemoteError> {
    result.map_err(|e| e.to_remote()).and_then(|value| to_json(&value))
}

#[async_trait]
impl Service for PluginServer {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        match method {
            methods::NAME => reply(self.plugin.name().await),
            methods::REGISTER => reply(self.register(parse_params(params)?).await),
            methods::UNREGISTER => reply(self.plugin.unregister().await),
            methods::MESSAGE => {
                let FullMessage { message, source } = parse_params(params)?;
                reply(self.plugin.message(source, message).await)
            }
            methods::DISCOVER => {
                let trigger: Trigger = parse_params(params)?;
                reply(self.plugin.discover(trigger).await)
            }
            methods::RESOLVE => reply(self.plugin.resolve(parse_params(params)?).await),
            methods::NOTIFY => reply(self.notify(parse_params(params)?).await),
            methods::CLI_METHOD => reply(self.cli_method(parse_params(params)?).await),
            other => Err(unknown_method(other)),
        }
    }

    // host callbacks may call back into the plugin while a request is pending
    fn dispatch(&self) -> Dispatch {
        Dispatch::Concurrent
    }
}
