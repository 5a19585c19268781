//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use reeve_proto::{Capabilities, Env, Pipeline};
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

const MASK: &str = "********";

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Get the current format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => value.write_table(writer)?,
        }
        Ok(())
    }

    /// Write a value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// The plugin's self-reported name.
#[derive(Debug, Clone, Serialize)]
pub struct PluginName {
    /// Name.
    pub name: String,
}

impl TableDisplay for PluginName {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{}", self.name)?;
        Ok(())
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

impl TableDisplay for Capabilities {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Capabilities")?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Message:          {}", yes_no(self.message))?;
        writeln!(writer, "Discover:         {}", yes_no(self.discover))?;
        writeln!(writer, "Resolve:          {}", yes_no(self.resolve))?;
        writeln!(writer, "Notify:           {}", yes_no(self.notify))?;

        if !self.cli_methods.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "CLI Methods")?;
            let methods: BTreeMap<_, _> = self.cli_methods.iter().collect();
            let width = methods.keys().map(|name| name.len()).max().unwrap_or(0);
            for (name, description) in methods {
                writeln!(writer, "  {name:<width$}  {description}")?;
            }
        }
        Ok(())
    }
}

/// Pipelines returned by `Discover`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineList {
    /// Discovered pipelines.
    pub pipelines: Vec<Pipeline>,
}

impl TableDisplay for PipelineList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.pipelines.is_empty() {
            writeln!(writer, "No pipelines discovered.")?;
            return Ok(());
        }

        writeln!(writer, "{:<24}  {:<6}  HEADLINE", "NAME", "STEPS")?;
        for pipeline in &self.pipelines {
            writeln!(
                writer,
                "{:<24}  {:<6}  {}",
                pipeline.name(),
                pipeline.definition.steps.len(),
                pipeline.definition.headline
            )?;
        }
        Ok(())
    }
}

/// One resolved environment value.
#[derive(Debug, Clone, Serialize)]
pub struct EnvEntry {
    /// Key.
    pub key: String,
    /// Value, masked for secrets unless revealed.
    pub value: String,
    /// Priority.
    pub priority: u32,
    /// Whether the plugin marked the value secret.
    pub secret: bool,
}

/// Values returned by `Resolve`, sorted by key.
#[derive(Debug, Clone, Serialize)]
pub struct EnvList {
    /// Entries.
    pub env: Vec<EnvEntry>,
    /// Requested keys the plugin did not resolve.
    pub missing: Vec<String>,
}

impl EnvList {
    /// Build the listing for `requested` keys from a plugin's answer.
    #[must_use]
    pub fn new(requested: &[String], resolved: HashMap<String, Env>, reveal: bool) -> Self {
        let mut missing: Vec<String> =
            requested.iter().filter(|key| !resolved.contains_key(*key)).cloned().collect();
        missing.sort();
        missing.dedup();

        let mut env: Vec<EnvEntry> = resolved
            .into_iter()
            .map(|(key, env)| EnvEntry {
                key,
                value: if env.secret && !reveal { MASK.to_string() } else { env.value },
                priority: env.priority,
                secret: env.secret,
            })
            .collect();
        env.sort_by(|a, b| a.key.cmp(&b.key));

        Self { env, missing }
    }
}

impl TableDisplay for EnvList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        let width = self.env.iter().map(|entry| entry.key.len()).max().unwrap_or(0).max(3);
        writeln!(writer, "{:<width$}  {:<8}  VALUE", "KEY", "PRIORITY")?;
        for entry in &self.env {
            writeln!(writer, "{:<width$}  {:<8}  {}", entry.key, entry.priority, entry.value)?;
        }
        if !self.missing.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "Unresolved: {}", self.missing.join(", "))?;
        }
        Ok(())
    }
}

/// Acknowledgement of an operation without a result.
#[derive(Debug, Clone, Serialize)]
pub struct Delivered {
    /// Operation name.
    pub operation: String,
}

impl TableDisplay for Delivered {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{} delivered", self.operation)?;
        Ok(())
    }
}

/// Output of a plugin CLI method.
#[derive(Debug, Clone, Serialize)]
pub struct MethodReply {
    /// Method name.
    pub method: String,
    /// Text the plugin returned.
    pub output: String,
}

impl TableDisplay for MethodReply {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.output.ends_with('\n') || self.output.is_empty() {
            write!(writer, "{}", self.output)?;
        } else {
            writeln!(writer, "{}", self.output)?;
        }
        Ok(())
    }
}
