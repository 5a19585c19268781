//! # reeve-proto
//!
//! Data shapes that cross the boundary between the Reeve host and its
//! out-of-process plugins, plus the log reader capabilities and the
//! interfaces of the host-side collaborators that consume these shapes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod collaborators;
pub mod encoding;
pub mod error;
pub mod logs;
pub mod messages;
pub mod pipeline;
pub mod status;
pub mod types;

pub use collaborators::{ConditionEngine, LogLineWriter, Resolution, ResolvedRunConfig, RunConfigResolver};
pub use error::{ProtoError, StreamError};
pub use logs::{LogReader, LogReaderProvider, NoLogs};
pub use messages::{FullMessage, Message, MessageSource};
pub use pipeline::{Condition, Param, Pipeline, PipelineDefinition, RunConfig, Step};
pub use status::{PipelineResult, PipelineStatus, Status};
pub use types::{Capabilities, Env, Fact, Trigger, Var};
