//! The plugin capability set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reeve_proto::{Capabilities, Env, Message, MessageSource, Pipeline, PipelineStatus, Trigger};

use crate::callback::ReeveApi;
use crate::error::{PluginError, PluginResult};

/// Operations a plugin offers to the host.
///
/// The same trait is implemented by plugins themselves and by
/// [`PluginClient`](crate::client::PluginClient), which forwards every call
/// to a plugin process. Optional operations default to
/// [`PluginError::NotImplemented`]; which ones a plugin really supports is
/// declared by the [`Capabilities`] returned from [`Plugin::register`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The plugin's name. Has no side effects and may be called before
    /// registration.
    async fn name(&self) -> PluginResult<String>;

    /// Register with the host.
    ///
    /// `api` stays usable until the host tears the registration down, so
    /// plugins may keep it to push messages and triggers at any time.
    async fn register(
        &self,
        settings: HashMap<String, String>,
        api: Arc<dyn ReeveApi>,
    ) -> PluginResult<Capabilities>;

    /// Tear down the registration.
    async fn unregister(&self) -> PluginResult<()>;

    /// Deliver a message.
    async fn message(&self, source: MessageSource, message: Message) -> PluginResult<()> {
        let _ = (source, message);
        Err(PluginError::NotImplemented("Message".to_string()))
    }

    /// Find the pipelines an external event starts.
    async fn discover(&self, trigger: Trigger) -> PluginResult<Vec<Pipeline>> {
        let _ = trigger;
        Err(PluginError::NotImplemented("Discover".to_string()))
    }

    /// Resolve environment values by key.
    async fn resolve(&self, env: Vec<String>) -> PluginResult<HashMap<String, Env>> {
        let _ = env;
        Err(PluginError::NotImplemented("Resolve".to_string()))
    }

    /// Receive a pipeline status update, possibly with live logs attached.
    async fn notify(&self, status: PipelineStatus) -> PluginResult<()> {
        let _ = status;
        Err(PluginError::NotImplemented("Notify".to_string()))
    }

    /// Run a CLI subcommand declared in [`Capabilities::cli_methods`].
    async fn cli_method(&self, method: String, args: Vec<String>) -> PluginResult<String> {
        let _ = args;
        Err(PluginError::NotImplemented(format!("CLIMethod {method}")))
    }
}
