//! Interfaces of the host-side components that consume plugin data.
//!
//! The condition engine, the run configuration resolver and the scoped log
//! writer are implemented by the host. Plugins never call them, but the
//! values they exchange over the bridge (`Trigger`, `Pipeline`, `Env`) must
//! stay usable by them.

use std::collections::HashMap;
use std::io;

use crate::error::ProtoError;
use crate::pipeline::{Condition, RunConfig};
use crate::types::{Env, Fact, Var};

/// Decides whether a pipeline or step runs for a set of facts.
pub trait ConditionEngine {
    /// Check every condition against the facts.
    fn check(
        &self,
        facts: &HashMap<String, Fact>,
        conditions: &HashMap<String, Condition>,
        env: &HashMap<String, Env>,
        vars: &HashMap<String, Var>,
    ) -> Result<bool, ProtoError>;
}

/// A run configuration with every parameter resolved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedRunConfig {
    /// Command arguments.
    pub command: Vec<String>,
    /// Standard input.
    pub input: String,
    /// Working directory.
    pub directory: String,
    /// User to run as.
    pub user: String,
    /// Named task parameters.
    pub params: HashMap<String, String>,
}

/// Result of resolving a run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    /// The resolved configuration.
    pub config: ResolvedRunConfig,
    /// Environment keys that had no value.
    pub unresolved_env: Vec<String>,
    /// Variable keys that had no value.
    pub unresolved_vars: Vec<String>,
}

/// Resolves parameters of a run configuration from env and vars.
pub trait RunConfigResolver {
    /// Resolve `config`, reporting the keys that could not be found.
    fn resolve(
        &self,
        config: &RunConfig,
        env: &HashMap<String, Env>,
        vars: &HashMap<String, Var>,
    ) -> Result<Resolution, ProtoError>;
}

/// Writes activity output, interleaving lines from several scopes.
pub trait LogLineWriter: Send {
    /// Write bytes produced within `scope`.
    fn write_scoped(&mut self, scope: &str, data: &[u8]) -> io::Result<usize>;
}
