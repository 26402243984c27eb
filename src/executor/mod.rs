//! Execution backends for chunk jobs.
//!
//! The scheduler only ever submits a [`ChunkSpec`] and polls the returned
//! [`JobId`]; whether the chunk runs in-process or on a cluster node is the
//! backend's business.

mod command;
mod local;

pub use command::CommandExecutor;
pub use local::LocalExecutor;

use crate::error::PipelineResult;
use crate::index::ChunkSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle of a submitted chunk job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Opaque, backend-assigned job handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A backend that runs chunk jobs.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start a job for `spec`. An error means the job was never started.
    async fn submit(&self, spec: &ChunkSpec) -> PipelineResult<JobId>;

    /// Current state of a submitted job.
    async fn poll_state(&self, job: &JobId) -> PipelineResult<JobState>;

    /// Stop a job the scheduler has stopped tracking, before the chunk is
    /// resubmitted. Once this returns `Ok` the job writes no manifest.
    /// Cancelling a finished job is a no-op.
    async fn cancel(&self, job: &JobId) -> PipelineResult<()>;
}
