//! Pipeline definitions returned by `Discover`.
//!
//! Only the shapes that cross the plugin boundary live here; matching
//! conditions and resolving run configurations are done by the host's
//! collaborators (see [`crate::collaborators`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Env, Fact};

/// A run parameter.
///
/// Every shape carries an explicit `kind` discriminator on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Param {
    /// A literal string.
    Literal {
        /// The value.
        value: String,
    },
    /// A reference to an environment value, with optional replacements.
    Env {
        /// Environment key.
        env: String,
        /// Replacement expressions applied to the resolved value.
        #[serde(default)]
        replace: Vec<String>,
    },
    /// A reference to a variable, with optional replacements.
    Var {
        /// Variable key.
        var: String,
        /// Replacement expressions applied to the resolved value.
        #[serde(default)]
        replace: Vec<String>,
    },
    /// A list of literal strings (used for pre-split commands).
    List {
        /// The values.
        values: Vec<String>,
    },
}

impl Param {
    /// Create a literal parameter.
    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal { value: value.into() }
    }

    /// Create an environment reference without replacements.
    #[must_use]
    pub fn env(key: impl Into<String>) -> Self {
        Self::Env {
            env: key.into(),
            replace: Vec::new(),
        }
    }

    /// Create a variable reference without replacements.
    #[must_use]
    pub fn var(key: impl Into<String>) -> Self {
        Self::Var {
            var: key.into(),
            replace: Vec::new(),
        }
    }

    /// Create a list parameter.
    #[must_use]
    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// The environment key this parameter refers to, if any.
    #[must_use]
    pub fn env_key(&self) -> Option<&str> {
        match self {
            Self::Env { env, .. } if !env.is_empty() => Some(env),
            _ => None,
        }
    }
}

/// What to run and with which inputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Task image or name.
    pub task: String,
    /// Command; a literal is shell-split by the resolver.
    pub command: Option<Param>,
    /// Standard input.
    pub input: Option<Param>,
    /// Working directory.
    pub directory: Option<Param>,
    /// User to run as.
    pub user: Option<Param>,
    /// Named task parameters.
    pub params: HashMap<String, Param>,
}

impl RunConfig {
    /// Environment keys referenced by this configuration.
    ///
    /// Plugins use this to know which values to `Resolve`.
    #[must_use]
    pub fn env_keys(&self) -> Vec<String> {
        [&self.command, &self.input, &self.directory, &self.user]
            .into_iter()
            .flatten()
            .chain(self.params.values())
            .filter_map(Param::env_key)
            .map(str::to_string)
            .collect()
    }
}

/// A matching rule for one fact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    /// Literal values of which one must match.
    pub include: Vec<String>,
    /// Literal values of which none may match.
    pub exclude: Vec<String>,
    /// Environment keys whose values must match.
    #[serde(rename = "include env")]
    pub include_env: Vec<String>,
    /// Environment keys whose values may not match.
    #[serde(rename = "exclude env")]
    pub exclude_env: Vec<String>,
    /// Variable keys whose values must match.
    #[serde(rename = "include var")]
    pub include_var: Vec<String>,
    /// Variable keys whose values may not match.
    #[serde(rename = "exclude var")]
    pub exclude_var: Vec<String>,
    /// Regular expressions of which one must match.
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    /// Regular expressions of which none may match.
    pub mismatch: Vec<String>,
}

impl Condition {
    /// Returns true if the condition has no rules (always matches).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
            && self.exclude.is_empty()
            && self.include_env.is_empty()
            && self.exclude_env.is_empty()
            && self.include_var.is_empty()
            && self.exclude_var.is_empty()
            && self.matches.is_empty()
            && self.mismatch.is_empty()
    }
}

/// A single pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Step {
    /// What the step runs.
    #[serde(flatten)]
    pub run: RunConfig,
    /// Step name.
    pub name: String,
    /// Stage the step belongs to.
    pub stage: String,
    /// Conditions for running the step.
    pub when: HashMap<String, Condition>,
    /// Whether a failure of this step fails the pipeline.
    pub ignore_failure: bool,
}

/// The user-authored part of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// One-line summary.
    pub headline: String,
    /// Longer description.
    pub description: String,
    /// Conditions for running the pipeline.
    pub when: HashMap<String, Condition>,
    /// Steps in order.
    pub steps: Vec<Step>,
}

/// A discovered pipeline, ready to be matched and scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Pipeline {
    /// Definition.
    #[serde(flatten)]
    pub definition: PipelineDefinition,
    /// Environment contributed by the discovering plugin.
    pub env: HashMap<String, Env>,
    /// Facts the conditions are checked against.
    pub facts: HashMap<String, Fact>,
    /// Task name to domain.
    pub task_domains: HashMap<String, String>,
    /// Domains whose tasks may receive secrets.
    pub trusted_domains: Vec<String>,
    /// Tasks that may receive secrets.
    pub trusted_tasks: Vec<String>,
    /// Setup run before the steps.
    pub setup: RunConfig,
}

impl Pipeline {
    /// Create an empty pipeline with a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            definition: PipelineDefinition {
                name: name.into(),
                ..PipelineDefinition::default()
            },
            ..Self::default()
        }
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Param::literal("make"), "literal" ; "literal")]
    #[test_case(Param::env("TOKEN"), "env" ; "env reference")]
    #[test_case(Param::var("branch"), "var" ; "var reference")]
    #[test_case(Param::list(["make", "test"]), "list" ; "list of strings")]
    fn param_carries_discriminator(param: Param, kind: &str) {
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["kind"], kind);
    }

    #[test]
    fn test_param_without_discriminator_is_rejected() {
        let result = serde_json::from_str::<Param>(r#"{"env":"TOKEN"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_param_replace_defaults_to_empty() {
        let param: Param = serde_json::from_str(r#"{"kind":"env","env":"TOKEN"}"#).unwrap();
        assert_eq!(param, Param::env("TOKEN"));
    }

    #[test]
    fn test_run_config_env_keys() {
        let mut config = RunConfig {
            task: "alpine".into(),
            command: Some(Param::env("CMD")),
            input: Some(Param::literal("stdin")),
            directory: Some(Param::var("dir")),
            user: Some(Param::env("USER")),
            params: HashMap::new(),
        };
        config.params.insert("token".into(), Param::env("TOKEN"));
        config.params.insert("empty".into(), Param::env(""));

        let mut keys = config.env_keys();
        keys.sort();
        assert_eq!(keys, vec!["CMD", "TOKEN", "USER"]);
    }

    #[test]
    fn test_condition_is_empty() {
        assert!(Condition::default().is_empty());

        let condition = Condition {
            matches: vec!["^main$".into()],
            ..Condition::default()
        };
        assert!(!condition.is_empty());
    }

    #[test]
    fn test_condition_field_names() {
        let condition: Condition =
            serde_json::from_str(r#"{"include env":["A"],"match":["x"]}"#).unwrap();
        assert_eq!(condition.include_env, vec!["A"]);
        assert_eq!(condition.matches, vec!["x"]);
    }

    #[test]
    fn test_pipeline_definition_is_flattened() {
        let pipeline = Pipeline::named("build");
        let json = serde_json::to_value(&pipeline).unwrap();
        assert_eq!(json["name"], "build");
        assert!(json.get("definition").is_none());
        assert!(json.get("taskDomains").is_some());
    }

    #[test]
    fn test_step_run_config_is_flattened() {
        let step: Step = serde_json::from_str(
            r#"{"name":"test","task":"rust","command":{"kind":"literal","value":"cargo test"},"ignoreFailure":true}"#,
        )
        .unwrap();
        assert_eq!(step.run.task, "rust");
        assert_eq!(step.run.command, Some(Param::literal("cargo test")));
        assert!(step.ignore_failure);
    }
}
