//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use reeve_proto::Status;
use reeve_proto::messages::BROADCAST_TARGET;

/// Drive a Reeve plugin from the command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "reeve")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Plugin executable to launch.
    #[arg(short, long, env = "REEVE_PLUGIN_PATH")]
    pub plugin: PathBuf,

    /// Setting passed to the plugin at registration, repeatable.
    #[arg(short, long = "setting", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub settings: Vec<(String, String)>,

    /// Seconds to wait for the plugin to complete the handshake.
    #[arg(long, env = "REEVE_PLUGIN_STARTUP_TIMEOUT", default_value_t = 10)]
    pub startup_timeout: u64,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the plugin's name without registering it.
    Name,

    /// Register the plugin and print the capabilities it declares.
    Capabilities,

    /// Ask the plugin for the pipelines a trigger starts.
    Discover {
        /// Trigger attribute.
        #[arg(value_name = "KEY=VALUE", value_parser = parse_key_value)]
        attributes: Vec<(String, String)>,
    },

    /// Ask the plugin for environment values.
    Resolve {
        /// Environment keys to resolve.
        #[arg(required = true)]
        keys: Vec<String>,

        /// Print secret values instead of masking them.
        #[arg(long)]
        reveal: bool,
    },

    /// Deliver a message to the plugin as the host API.
    Message {
        /// Message target.
        #[arg(short, long, default_value = BROADCAST_TARGET)]
        target: String,

        /// Message option, repeatable.
        #[arg(short, long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        options: Vec<(String, String)>,

        /// Message payload.
        data: String,
    },

    /// Send a pipeline status update, optionally with logs from a file.
    Notify {
        /// Pipeline name.
        pipeline: String,

        /// Activity id.
        #[arg(long, default_value = "cli")]
        activity: String,

        /// Pipeline status.
        #[arg(long, value_parser = parse_status, default_value = "success")]
        status: Status,

        /// File served to the plugin as the pipeline's logs.
        #[arg(long)]
        logs: Option<PathBuf>,

        /// Seconds to keep serving logs after the plugin was notified.
        #[arg(long, default_value_t = 0)]
        hold: u64,
    },

    /// Any other subcommand runs a CLI method declared by the plugin.
    #[command(external_subcommand)]
    Plugin(Vec<String>),
}

/// Parse a `KEY=VALUE` pair.
///
/// # Errors
///
/// Returns an error if there is no `=` or the key is empty.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

/// Parse a pipeline status by its lowercase name.
///
/// # Errors
///
/// Returns an error for unknown names.
pub fn parse_status(s: &str) -> Result<Status, String> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| format!("unknown status `{s}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["reeve", "--plugin", "/bin/plugin"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test_case("a=b", ("a", "b"); "simple")]
    #[test_case("a=", ("a", ""); "empty value")]
    #[test_case("a=b=c", ("a", "b=c"); "value keeps equals")]
    fn key_value_parses(input: &str, expected: (&str, &str)) {
        let (key, value) = parse_key_value(input).unwrap();
        assert_eq!((key.as_str(), value.as_str()), expected);
    }

    #[test_case("novalue")]
    #[test_case("=value")]
    fn key_value_rejects(input: &str) {
        assert!(parse_key_value(input).is_err());
    }

    #[test_case("success", Status::Success)]
    #[test_case("Running", Status::Running)]
    #[test_case("timeout", Status::Timeout)]
    fn status_parses(input: &str, expected: Status) {
        assert_eq!(parse_status(input).unwrap(), expected);
    }

    #[test]
    fn status_rejects_unknown() {
        assert!(parse_status("exploded").is_err());
    }

    #[test]
    fn cli_parses_name() {
        let cli = parse(&["name"]);
        assert!(matches!(cli.command, Commands::Name));
        assert_eq!(cli.plugin, PathBuf::from("/bin/plugin"));
        assert_eq!(cli.format, Format::Table);
    }

    #[test]
    fn cli_collects_settings() {
        let cli = parse(&["-s", "a=1", "--setting", "b=2", "capabilities"]);
        assert_eq!(
            cli.settings,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn cli_respects_format_flag() {
        let cli = parse(&["--format", "json", "capabilities"]);
        assert_eq!(cli.format, Format::Json);
    }

    #[test]
    fn cli_parses_discover_attributes() {
        let cli = parse(&["discover", "repo=reeve", "branch=main"]);
        match cli.command {
            Commands::Discover { attributes } => assert_eq!(attributes.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_requires_resolve_keys() {
        let result = Cli::try_parse_from(["reeve", "-p", "/bin/plugin", "resolve"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_message_defaults() {
        let cli = parse(&["message", "hello"]);
        match cli.command {
            Commands::Message { target, options, data } => {
                assert_eq!(target, BROADCAST_TARGET);
                assert!(options.is_empty());
                assert_eq!(data, "hello");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_parses_notify() {
        let cli = parse(&["notify", "build", "--status", "failed", "--logs", "out.log"]);
        match cli.command {
            Commands::Notify { pipeline, status, logs, hold, .. } => {
                assert_eq!(pipeline, "build");
                assert_eq!(status, Status::Failed);
                assert_eq!(logs, Some(PathBuf::from("out.log")));
                assert_eq!(hold, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_forwards_unknown_subcommands_to_plugin() {
        let cli = parse(&["greet", "world", "--loud"]);
        match cli.command {
            Commands::Plugin(args) => assert_eq!(args, vec!["greet", "world", "--loud"]),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
