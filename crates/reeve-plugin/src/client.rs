//! Host-side plugin facade.
//!
//! [`PluginClient`] presents a plugin process as a local [`Plugin`]. It
//! owns the background services the host runs on the plugin's behalf: the
//! callback API served during registration and one log provider per
//! notification with live logs.

use std::collections::HashMap;
use std::iter;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reeve_proto::{Capabilities, Env, FullMessage, Message, MessageSource, Pipeline, PipelineStatus, Trigger};
use serde_json::Value;
use tracing::{debug, info};

use crate::broker::{Broker, ServiceHandle};
use crate::callback::{ApiServer, ReeveApi};
use crate::error::PluginResult;
use crate::logs::LogReaderProviderServer;
use crate::plugin::Plugin;
use crate::protocol::{ConnId, LogsRef, NotifyParams, RegisterParams, methods};
use crate::rpc::RpcClient;

/// A plugin process seen from the host.
pub struct PluginClient {
    broker: Broker,
    control: RpcClient,
    callback: Mutex<Option<ServiceHandle>>,
    log_services: Mutex<Vec<ServiceHandle>>,
}

impl PluginClient {
    /// Create a facade calling over the control connection of `broker`.
    pub fn new(broker: Broker) -> PluginResult<Self> {
        let control = broker.control_client()?;
        Ok(Self {
            broker,
            control,
            callback: Mutex::new(None),
            log_services: Mutex::new(Vec::new()),
        })
    }

    /// The broker carrying this plugin's connections.
    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Connection serving the callback API, while it is served.
    #[must_use]
    pub fn callback_conn(&self) -> Option<ConnId> {
        self.callback
            .lock()
            .as_ref()
            .filter(|handle| !handle.is_finished())
            .map(ServiceHandle::conn)
    }

    /// Connections currently serving log providers.
    #[must_use]
    pub fn log_connections(&self) -> Vec<ConnId> {
        let mut services = self.log_services.lock();
        services.retain(|handle| !handle.is_finished());
        services.iter().map(ServiceHandle::conn).collect()
    }

    /// Stop serving the callback API and release the host's API object.
    ///
    /// Call once the host is done with the registration; until then the
    /// plugin's pushes stay deliverable, even after [`Plugin::unregister`].
    pub async fn release_callback(&self) {
        let handle = self.callback.lock().take();
        if let Some(handle) = handle {
            debug!(conn = handle.conn(), "releasing callback API");
            handle.shutdown().await;
        }
    }

    /// Release the callback API, stop serving logs, and close the control
    /// connection.
    pub async fn close(&self) {
        self.release_callback().await;
        let services = std::mem::take(&mut *self.log_services.lock());
        for handle in services {
            handle.shutdown().await;
        }
        self.control.close().await;
    }

    fn track_log_service(&self, handle: ServiceHandle) {
        let mut services = self.log_services.lock();
        services.retain(|handle| !handle.is_finished());
        services.push(handle);
    }
}

#[async_trait]
impl Plugin for PluginClient {
    async fn name(&self) -> PluginResult<String> {
        self.control.invoke(methods::NAME, &()).await
    }

    async fn register(
        &self,
        settings: HashMap<String, String>,
        api: Arc<dyn ReeveApi>,
    ) -> PluginResult<Capabilities> {
        let api_conn = self.broker.allocate();
        let handle = self.broker.accept_and_serve(api_conn, ApiServer::new(api))?;
        debug!(api_conn, "serving callback API");

        let params = RegisterParams { settings, api_conn };
        match self.control.invoke(methods::REGISTER, &params).await {
            Ok(capabilities) => {
                let previous = self.callback.lock().replace(handle);
                if let Some(previous) = previous {
                    previous.cancel();
                }
                info!(api_conn, "plugin registered");
                Ok(capabilities)
            }
            Err(e) => {
                // a plugin that failed to register keeps no callback
                handle.cancel();
                Err(e)
            }
        }
    }

    async fn unregister(&self) -> PluginResult<()> {
        let _: Value = self.control.invoke(methods::UNREGISTER, &()).await?;
        info!("plugin unregistered");
        Ok(())
    }

    async fn message(&self, source: MessageSource, message: Message) -> PluginResult<()> {
        let _: Value = self
            .control
            .invoke(methods::MESSAGE, &FullMessage::new(source, message))
            .await?;
        Ok(())
    }

    async fn discover(&self, trigger: Trigger) -> PluginResult<Vec<Pipeline>> {
        self.control.invoke(methods::DISCOVER, &trigger).await
    }

    async fn resolve(&self, env: Vec<String>) -> PluginResult<HashMap<String, Env>> {
        self.control.invoke(methods::RESOLVE, &env).await
    }

    async fn notify(&self, mut status: PipelineStatus) -> PluginResult<()> {
        let provider = status.logs.take().filter(|logs| logs.available());
        let (logs, handle) = match provider {
            Some(provider) => {
                let conn = self.broker.allocate();
                let server = LogReaderProviderServer::new(provider, self.broker.clone());
                let handle = self.broker.accept_and_serve(conn, server)?;
                debug!(conn, activity = %status.activity_id, "serving logs");
                (LogsRef::attached(conn), Some(handle))
            }
            None => (LogsRef::absent(), None),
        };

        let result: PluginResult<Value> = self
            .control
            .invoke(methods::NOTIFY, &NotifyParams { status, logs })
            .await;
        match (result, handle) {
            (Ok(_), Some(handle)) => {
                self.track_log_service(handle);
                Ok(())
            }
            (Ok(_), None) => Ok(()),
            (Err(e), handle) => {
                if let Some(handle) = handle {
                    handle.cancel();
                }
                Err(e)
            }
        }
    }

    async fn cli_method(&self, method: String, args: Vec<String>) -> PluginResult<String> {
        let flat: Vec<String> = iter::once(method).chain(args).collect();
        self.control.invoke(methods::CLI_METHOD, &flat).await
    }
}
