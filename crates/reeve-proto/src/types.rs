//! Core types shared by the host and its plugins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Prefix marking a condition key that refers to an environment value.
pub const ENV_PREFIX: &str = "env ";

/// Prefix marking a condition key that refers to a variable.
pub const VAR_PREFIX: &str = "var ";

/// Worker group used when a pipeline does not name one.
pub const DEFAULT_WORKER_GROUP: &str = "default";

/// Stage used when a step does not name one.
pub const DEFAULT_STAGE: &str = "default";

/// Event name sent once the host has finished starting up.
pub const EVENT_STARTUP_COMPLETE: &str = "startup complete";

/// Attributes of an external event, passed to `Discover`.
pub type Trigger = HashMap<String, String>;

/// A variable value.
pub type Var = String;

/// A fact: the list of values a pipeline condition is checked against.
pub type Fact = Vec<String>;

/// An environment value contributed by a plugin or pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Env {
    /// The value.
    pub value: String,
    /// Merge priority; higher wins.
    pub priority: u32,
    /// Whether the value must be masked in logs.
    pub secret: bool,
}

impl Env {
    /// Create a plain, non-secret value with priority 0.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            priority: 0,
            secret: false,
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the value as secret.
    #[must_use]
    pub const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// The optional operations a plugin implements, declared at registration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Plugin accepts `Message`.
    pub message: bool,
    /// Plugin accepts `Discover`.
    pub discover: bool,
    /// Plugin accepts `Resolve`.
    pub resolve: bool,
    /// Plugin accepts `Notify`.
    pub notify: bool,
    /// CLI subcommand name to short description.
    pub cli_methods: HashMap<String, String>,
}

impl Capabilities {
    /// Capabilities of a plugin that implements no optional operation.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Declare `Message`.
    #[must_use]
    pub const fn with_message(mut self) -> Self {
        self.message = true;
        self
    }

    /// Declare `Discover`.
    #[must_use]
    pub const fn with_discover(mut self) -> Self {
        self.discover = true;
        self
    }

    /// Declare `Resolve`.
    #[must_use]
    pub const fn with_resolve(mut self) -> Self {
        self.resolve = true;
        self
    }

    /// Declare `Notify`.
    #[must_use]
    pub const fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }

    /// Declare a CLI subcommand.
    #[must_use]
    pub fn with_cli_method(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.cli_methods.insert(name.into(), description.into());
        self
    }

    /// Returns true if `name` is a declared CLI subcommand.
    #[must_use]
    pub fn has_cli_method(&self, name: &str) -> bool {
        self.cli_methods.contains_key(name)
    }
}
