//! Callback API bridge.
//!
//! During registration the host serves its [`ReeveApi`] on a fresh
//! connection; the plugin dials it and receives an [`ApiClient`] through
//! which it pushes messages and triggers for as long as the registration
//! lives.

use std::sync::Arc;

use async_trait::async_trait;
use reeve_proto::{Message, Trigger};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PluginResult, RemoteError};
use crate::protocol::{MessagesParams, TriggersParams, methods};
use crate::rpc::{Dispatch, RpcClient, Service, parse_params, unknown_method};

/// The host operations a plugin may call back into.
#[async_trait]
pub trait ReeveApi: Send + Sync {
    /// Push messages to the host.
    async fn notify_messages(&self, messages: Vec<Message>) -> PluginResult<()>;

    /// Push triggers to the host.
    async fn notify_triggers(&self, triggers: Vec<Trigger>) -> PluginResult<()>;

    /// Release the API.
    async fn close(&self) -> PluginResult<()>;
}

/// Serves a host [`ReeveApi`] to a plugin.
pub struct ApiServer {
    api: Arc<dyn ReeveApi>,
}

impl ApiServer {
    /// Serve `api`.
    #[must_use]
    pub fn new(api: Arc<dyn ReeveApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Service for ApiServer {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        match method {
            methods::NOTIFY_MESSAGES => {
                let MessagesParams { messages } = parse_params(params)?;
                debug!(count = messages.len(), "plugin pushed messages");
                self.api
                    .notify_messages(messages)
                    .await
                    .map_err(|e| e.to_remote())?;
            }
            methods::NOTIFY_TRIGGERS => {
                let TriggersParams { triggers } = parse_params(params)?;
                debug!(count = triggers.len(), "plugin pushed triggers");
                self.api
                    .notify_triggers(triggers)
                    .await
                    .map_err(|e| e.to_remote())?;
            }
            // the host decides when its API is released
            methods::API_CLOSE => {}
            other => return Err(unknown_method(other)),
        }
        Ok(Value::Null)
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch::Concurrent
    }

    async fn finish(&self) {
        if let Err(e) = self.api.close().await {
            warn!(error = %e, "failed to close callback API");
        }
    }
}

/// A plugin's handle to the host API, backed by a callback connection.
///
/// Clones share the connection; concurrent pushes are multiplexed onto it.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: RpcClient,
}

impl ApiClient {
    /// Wrap a dialed callback connection.
    #[must_use]
    pub const fn new(client: RpcClient) -> Self {
        Self { client }
    }

    /// Returns true once the host has released the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

#[async_trait]
impl ReeveApi for ApiClient {
    async fn notify_messages(&self, messages: Vec<Message>) -> PluginResult<()> {
        let _: Value = self
            .client
            .invoke(methods::NOTIFY_MESSAGES, &MessagesParams { messages })
            .await?;
        Ok(())
    }

    async fn notify_triggers(&self, triggers: Vec<Trigger>) -> PluginResult<()> {
        let _: Value = self
            .client
            .invoke(methods::NOTIFY_TRIGGERS, &TriggersParams { triggers })
            .await?;
        Ok(())
    }

    async fn close(&self) -> PluginResult<()> {
        self.client.close().await;
        Ok(())
    }
}
