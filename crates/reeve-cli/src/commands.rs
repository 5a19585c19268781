//! Command execution against a launched plugin.
//!
//! Every command launches the plugin, runs one operation, and shuts the
//! plugin down again. All commands except `name` register the plugin first
//! and unregister it afterwards.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reeve_plugin::{HostConfig, LogStream, Plugin, PluginProcess, StreamProvider};
use reeve_proto::{Capabilities, Message, MessageSource, Pipeline, PipelineStatus, Status, Trigger};
use tracing::{debug, warn};

use crate::api::LoggingApi;
use crate::cli::{Cli, Commands};
use crate::error::CliError;
use crate::output::{Delivered, EnvList, MethodReply, OutputFormat, PipelineList, PluginName};

/// Launches a plugin and runs one command against it.
#[derive(Debug, Clone)]
pub struct PluginCommand {
    config: HostConfig,
    settings: HashMap<String, String>,
}

impl PluginCommand {
    /// Create a command runner from parsed arguments.
    #[must_use]
    pub fn new(cli: &Cli) -> Self {
        let config = HostConfig::new(&cli.plugin)
            .with_startup_timeout(Duration::from_secs(cli.startup_timeout));
        Self::with_config(config, cli.settings.iter().cloned().collect())
    }

    /// Create a command runner from a host configuration.
    #[must_use]
    pub const fn with_config(config: HostConfig, settings: HashMap<String, String>) -> Self {
        Self { config, settings }
    }

    /// Launch the plugin, run `command`, and shut the plugin down.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin cannot be launched, rejects the
    /// command, or output fails.
    pub async fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        command: Commands,
    ) -> Result<(), CliError> {
        let process = PluginProcess::launch(self.config.clone()).await?;
        let plugin: Arc<dyn Plugin> = process.client();

        let result = self.run(plugin.as_ref(), writer, format, command).await;

        match process.shutdown().await {
            Ok(status) => debug!(%status, "plugin shut down"),
            Err(e) => warn!(error = %e, "plugin shutdown failed"),
        }
        result
    }

    /// Run `command` against an already connected plugin.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin rejects the command or output fails.
    pub async fn run<W: Write>(
        &self,
        plugin: &dyn Plugin,
        writer: &mut W,
        format: &OutputFormat,
        command: Commands,
    ) -> Result<(), CliError> {
        if matches!(command, Commands::Name) {
            let name = plugin.name().await?;
            return format.write(writer, &PluginName { name });
        }

        let api = Arc::new(LoggingApi::new());
        let capabilities = plugin.register(self.settings.clone(), api).await?;
        debug!(?capabilities, "plugin registered");

        let result = dispatch(plugin, &capabilities, writer, format, command).await;

        if let Err(e) = plugin.unregister().await {
            warn!(error = %e, "unregister failed");
        }
        result
    }
}

async fn dispatch<W: Write>(
    plugin: &dyn Plugin,
    capabilities: &Capabilities,
    writer: &mut W,
    format: &OutputFormat,
    command: Commands,
) -> Result<(), CliError> {
    match command {
        Commands::Name => {
            let name = plugin.name().await?;
            format.write(writer, &PluginName { name })
        }
        Commands::Capabilities => format.write(writer, capabilities),
        Commands::Discover { attributes } => {
            require(capabilities.discover, "Discover")?;
            let trigger: Trigger = attributes.into_iter().collect();
            let pipelines = plugin.discover(trigger).await?;
            format.write(writer, &PipelineList { pipelines })
        }
        Commands::Resolve { keys, reveal } => {
            require(capabilities.resolve, "Resolve")?;
            let resolved = plugin.resolve(keys.clone()).await?;
            format.write(writer, &EnvList::new(&keys, resolved, reveal))
        }
        Commands::Message { target, options, data } => {
            require(capabilities.message, "Message")?;
            let message = Message::new(target, options.into_iter().collect(), data.into_bytes());
            plugin.message(MessageSource::Api, message).await?;
            format.write(writer, &Delivered { operation: "Message".to_string() })
        }
        Commands::Notify { pipeline, activity, status, logs, hold } => {
            require(capabilities.notify, "Notify")?;
            let status = pipeline_status(pipeline, activity, status, logs.as_deref()).await?;
            plugin.notify(status).await?;
            if hold > 0 {
                tokio::time::sleep(Duration::from_secs(hold)).await;
            }
            format.write(writer, &Delivered { operation: "Notify".to_string() })
        }
        Commands::Plugin(args) => {
            let mut args = args.into_iter();
            let method = args
                .next()
                .ok_or_else(|| CliError::InvalidArgument("missing plugin command".to_string()))?;
            if !capabilities.has_cli_method(&method) {
                let mut available: Vec<String> = capabilities.cli_methods.keys().cloned().collect();
                available.sort();
                return Err(CliError::UnknownCommand { method, available });
            }
            let output = plugin.cli_method(method.clone(), args.collect()).await?;
            format.write(writer, &MethodReply { method, output })
        }
    }
}

fn require(declared: bool, operation: &'static str) -> Result<(), CliError> {
    if declared { Ok(()) } else { Err(CliError::Unsupported(operation)) }
}

async fn pipeline_status(
    pipeline: String,
    activity: String,
    status: Status,
    logs: Option<&Path>,
) -> Result<PipelineStatus, CliError> {
    let status = PipelineStatus::new(Pipeline::named(pipeline), activity, status);
    let Some(path) = logs else {
        return Ok(status);
    };
    let bytes = tokio::fs::read(path).await?;
    let provider = StreamProvider::from(LogStream::from_bytes(bytes));
    Ok(status.with_logs(Arc::new(provider)))
}
