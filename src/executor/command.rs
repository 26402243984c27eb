//! External-command executor, e.g. `srun sbem-prep worker --chunk {chunk}`.

use super::{Executor, JobId, JobState};
use crate::error::{PipelineError, PipelineResult};
use crate::index::ChunkSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::{Child, Command};

enum Job {
    Running(Child),
    Done(JobState),
}

/// Launches one external process per chunk.
///
/// The chunk spec is written as YAML into `spec_dir`; `{chunk}` in `args`
/// is replaced with its path and `{chunk_id}` with the chunk id. Exit
/// status 0 counts as success.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    spec_dir: PathBuf,
    jobs: Mutex<HashMap<String, Job>>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, spec_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            spec_dir: spec_dir.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn expand_args(&self, spec_path: &str, chunk_id: u32) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{chunk}", spec_path)
                    .replace("{chunk_id}", &chunk_id.to_string())
            })
            .collect()
    }

    fn lock(&self) -> PipelineResult<std::sync::MutexGuard<'_, HashMap<String, Job>>> {
        self.jobs
            .lock()
            .map_err(|_| PipelineError::Executor("job table poisoned".to_string()))
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn submit(&self, spec: &ChunkSpec) -> PipelineResult<JobId> {
        let chunk_id = spec.id();
        let submission = |reason: String| PipelineError::ChunkSubmission { chunk_id, reason };

        tokio::fs::create_dir_all(&self.spec_dir)
            .await
            .map_err(|e| submission(format!("cannot create {}: {}", self.spec_dir.display(), e)))?;
        let spec_path = self
            .spec_dir
            .join(format!("chunk_{:05}.yaml", chunk_id));
        tokio::fs::write(&spec_path, spec.to_yaml()?)
            .await
            .map_err(|e| submission(format!("cannot write {}: {}", spec_path.display(), e)))?;

        let args = self.expand_args(&spec_path.to_string_lossy(), chunk_id);
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| submission(format!("cannot launch {}: {}", self.program, e)))?;

        let id = match child.id() {
            Some(pid) => format!("pid-{}", pid),
            None => format!("chunk-{}", chunk_id),
        };
        tracing::debug!("Launched {} {:?} as {}", self.program, args, id);
        self.lock()?.insert(id.clone(), Job::Running(child));
        Ok(JobId(id))
    }

    async fn poll_state(&self, job: &JobId) -> PipelineResult<JobState> {
        let mut jobs = self.lock()?;
        let entry = jobs
            .get_mut(&job.0)
            .ok_or_else(|| PipelineError::Executor(format!("unknown job {}", job)))?;

        let state = match entry {
            Job::Done(state) => return Ok(*state),
            Job::Running(child) => match child.try_wait() {
                Ok(None) => return Ok(JobState::Running),
                Ok(Some(status)) if status.success() => JobState::Succeeded,
                Ok(Some(status)) => {
                    tracing::warn!("Job {} exited with {}", job, status);
                    JobState::Failed
                }
                Err(e) => {
                    return Err(PipelineError::Executor(format!("cannot poll {}: {}", job, e)))
                }
            },
        };
        *entry = Job::Done(state);
        Ok(state)
    }

    async fn cancel(&self, job: &JobId) -> PipelineResult<()> {
        let mut jobs = self.lock()?;
        let entry = jobs
            .get_mut(&job.0)
            .ok_or_else(|| PipelineError::Executor(format!("unknown job {}", job)))?;
        if let Job::Running(child) = entry {
            if let Ok(None) = child.try_wait() {
                child
                    .start_kill()
                    .map_err(|e| PipelineError::Executor(format!("cannot kill {}: {}", job, e)))?;
                tracing::debug!("Killed {}", job);
            }
            *entry = Job::Done(JobState::Failed);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Stage;
    use crate::index::{ConfigPartitioner, Section};
    use std::time::Duration;

    fn spec() -> ChunkSpec {
        let sections: Vec<Section> = (0..3).map(|i| Section::new(i, 0, "s")).collect();
        ConfigPartitioner::partition(&sections, Stage::CoarseOffsets, 5, &serde_json::json!({}))
            .unwrap()
            .remove(0)
    }

    async fn wait(exec: &CommandExecutor, job: &JobId) -> JobState {
        for _ in 0..200 {
            let state = exec.poll_state(job).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job);
    }

    #[tokio::test]
    async fn test_exit_status_maps_to_state() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = CommandExecutor::new("sh", vec!["-c".into(), "test -f {chunk}".into()], tmp.path());
        let job = ok.submit(&spec()).await.unwrap();
        assert_eq!(wait(&ok, &job).await, JobState::Succeeded);
        assert!(tmp.path().join("chunk_00000.yaml").exists());

        let bad = CommandExecutor::new("sh", vec!["-c".into(), "exit 3".into()], tmp.path());
        let job = bad.submit(&spec()).await.unwrap();
        assert_eq!(wait(&bad, &job).await, JobState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_kills_running_job() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("finished");
        let script = format!("sleep 2; touch {}", marker.display());
        let exec = CommandExecutor::new("sh", vec!["-c".into(), script], tmp.path());
        let job = exec.submit(&spec()).await.unwrap();
        assert_eq!(exec.poll_state(&job).await.unwrap(), JobState::Running);

        exec.cancel(&job).await.unwrap();
        assert_eq!(exec.poll_state(&job).await.unwrap(), JobState::Failed);
        exec.cancel(&job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_unlaunchable_program_is_submission_error() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new("/nonexistent/sbem-worker", vec![], tmp.path());
        assert!(matches!(
            exec.submit(&spec()).await,
            Err(PipelineError::ChunkSubmission { chunk_id: 0, .. })
        ));
    }

    #[test]
    fn test_expand_args() {
        let exec = CommandExecutor::new(
            "srun",
            vec!["sbem-prep".into(), "worker".into(), "--chunk".into(), "{chunk}".into(), "--job-name=c{chunk_id}".into()],
            "/tmp",
        );
        assert_eq!(
            exec.expand_args("/tmp/chunk_00004.yaml", 4),
            vec!["sbem-prep", "worker", "--chunk", "/tmp/chunk_00004.yaml", "--job-name=c4"]
        );
    }
}
