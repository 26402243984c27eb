//! In-process executor: each chunk runs as a Tokio task.
//!
//! Cancelling aborts the task. Unit computation already handed to the
//! blocking pool runs to completion, but the manifest write that follows it
//! never happens.

use super::{Executor, JobId, JobState};
use crate::error::{PipelineError, PipelineResult};
use crate::index::ChunkSpec;
use crate::pipeline::ChunkWorker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

/// Runs [`ChunkWorker`]s on the current runtime.
pub struct LocalExecutor {
    worker: Arc<ChunkWorker>,
    jobs: Arc<Mutex<HashMap<String, JobState>>>,
    tasks: Mutex<HashMap<String, AbortHandle>>,
    next_id: AtomicU64,
}

impl LocalExecutor {
    pub fn new(worker: Arc<ChunkWorker>) -> Self {
        Self {
            worker,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn set_state(jobs: &Mutex<HashMap<String, JobState>>, id: &str, state: JobState) {
        if let Ok(mut jobs) = jobs.lock() {
            jobs.insert(id.to_string(), state);
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn submit(&self, spec: &ChunkSpec) -> PipelineResult<JobId> {
        let id = format!(
            "local-{}-{}",
            spec.id(),
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        Self::set_state(&self.jobs, &id, JobState::Pending);

        let worker = self.worker.clone();
        let jobs = self.jobs.clone();
        let spec = spec.clone();
        let job = id.clone();
        let task = tokio::spawn(async move {
            Self::set_state(&jobs, &job, JobState::Running);
            let state = match worker.run(&spec).await {
                Ok(_) => JobState::Succeeded,
                Err(e) => {
                    tracing::warn!("{} failed: {}", spec.chunk, e);
                    JobState::Failed
                }
            };
            Self::set_state(&jobs, &job, state);
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(id.clone(), task.abort_handle());
        }

        Ok(JobId(id))
    }

    async fn poll_state(&self, job: &JobId) -> PipelineResult<JobState> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| PipelineError::Executor("job table poisoned".to_string()))?;
        jobs.get(&job.0)
            .copied()
            .ok_or_else(|| PipelineError::Executor(format!("unknown job {}", job)))
    }

    async fn cancel(&self, job: &JobId) -> PipelineResult<()> {
        let task = self
            .tasks
            .lock()
            .map_err(|_| PipelineError::Executor("task table poisoned".to_string()))?
            .remove(&job.0);
        let Some(task) = task else {
            return Err(PipelineError::Executor(format!("unknown job {}", job)));
        };
        task.abort();

        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| PipelineError::Executor("job table poisoned".to_string()))?;
        if let Some(state) = jobs.get_mut(&job.0) {
            if !state.is_terminal() {
                *state = JobState::Failed;
            }
        }
        tracing::debug!("Cancelled {}", job);
        Ok(())
    }
}
