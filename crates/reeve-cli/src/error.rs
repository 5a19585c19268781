//! CLI error types.

use reeve_plugin::PluginError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// The plugin failed or could not be reached.
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// The plugin did not declare the capability a command needs.
    #[error("plugin does not support {0}")]
    Unsupported(&'static str),

    /// A plugin subcommand that the plugin does not declare.
    #[error("unknown plugin command `{method}` (available: {})", list_or_none(.available))]
    UnknownCommand {
        /// The requested method.
        method: String,
        /// Methods the plugin declares, sorted.
        available: Vec<String>,
    },

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() { "none".to_string() } else { items.join(", ") }
}
