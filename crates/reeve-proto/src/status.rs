//! Pipeline status notifications.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::logs::LogReaderProvider;
use crate::pipeline::Pipeline;

/// Lifecycle state of a pipeline activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Accepted, not yet handed to a worker.
    #[default]
    Enqueued,
    /// Handed to a worker, waiting to start.
    Waiting,
    /// Running.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with a failure.
    Failed,
    /// Exceeded its time limit.
    Timeout,
}

impl Status {
    /// Returns true while a worker holds the activity.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Returns true once the activity has reached a final state.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Enqueued => "enqueued",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Outcome of a finished activity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineResult {
    /// Whether the pipeline succeeded.
    pub success: bool,
    /// Exit code of the failing step, if any.
    pub exit_code: i32,
    /// Error description.
    pub error: String,
}

/// A status notification for one pipeline activity.
///
/// `logs` never travels inside the serialized form; the plugin bridge
/// carries it on a separate logical connection when it is available.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineStatus {
    /// The pipeline.
    pub pipeline: Pipeline,
    /// Worker group running the activity.
    pub worker_group: String,
    /// Activity identifier.
    #[serde(rename = "activityID")]
    pub activity_id: String,
    /// Current state.
    pub status: Status,
    /// Live logs, if attached.
    #[serde(skip)]
    pub logs: Option<Arc<dyn LogReaderProvider>>,
    /// Outcome once finished.
    pub result: PipelineResult,
}

impl PipelineStatus {
    /// Create a status without logs.
    #[must_use]
    pub fn new(pipeline: Pipeline, activity_id: impl Into<String>, status: Status) -> Self {
        Self {
            pipeline,
            activity_id: activity_id.into(),
            status,
            ..Self::default()
        }
    }

    /// Attach a log provider.
    #[must_use]
    pub fn with_logs(mut self, logs: Arc<dyn LogReaderProvider>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Returns true if logs are attached and can currently be read.
    #[must_use]
    pub fn logs_available(&self) -> bool {
        self.logs.as_ref().is_some_and(|logs| logs.available())
    }
}

impl fmt::Debug for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStatus")
            .field("pipeline", &self.pipeline.name())
            .field("worker_group", &self.worker_group)
            .field("activity_id", &self.activity_id)
            .field("status", &self.status)
            .field("logs_available", &self.logs_available())
            .field("result", &self.result)
            .finish()
    }
}
