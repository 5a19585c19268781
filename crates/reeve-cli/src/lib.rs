//! # reeve-cli
//!
//! Command-line driver for Reeve plugins.
//!
//! Launches a plugin binary the way the Reeve host does, registers it, and
//! runs a single operation against it. Subcommands the CLI does not know are
//! forwarded to the plugin's own CLI methods.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use error::CliError;
