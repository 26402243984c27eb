//! Shared fixtures for pipeline tests.

use crate::algorithm::{PairAligner, PairEstimate, Transform, UnitOutcome, UnitRunner};
use crate::config::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{Executor, JobId, JobState};
use crate::index::{ChunkSpec, ConfigPartitioner, Section};
use crate::io::ArtifactStore;
use crate::pipeline::{ChunkWorker, Metrics};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Sections numbered `0..n`.
pub(crate) fn sections(n: u32) -> Vec<Section> {
    (0..n)
        .map(|i| Section::new(i, 0, format!("/data/s{}_g0", i)))
        .collect()
}

pub(crate) fn pair_specs(n: u32, chunk_size: usize) -> Vec<ChunkSpec> {
    ConfigPartitioner::partition(
        &sections(n),
        Stage::CoarseOffsets,
        chunk_size,
        &serde_json::json!({ "min_overlap": 20 }),
    )
    .unwrap()
}

/// Deterministic aligner: offset `[1.0 + from / 100, 0.5]`, unresolved for
/// pairs starting at a section in `refuse`.
pub(crate) struct ShiftAligner {
    pub refuse: HashSet<u32>,
}

impl ShiftAligner {
    pub(crate) fn new() -> Self {
        Self {
            refuse: HashSet::new(),
        }
    }
}

impl PairAligner for ShiftAligner {
    fn compute_pair(
        &self,
        a: &Section,
        _b: &Section,
        _params: &serde_json::Value,
    ) -> UnitOutcome<PairEstimate> {
        if self.refuse.contains(&a.num) {
            return UnitOutcome::unresolved("insufficient overlap");
        }
        UnitOutcome::Resolved(PairEstimate {
            transform: Transform::new(vec![1.0 + a.num as f64 / 100.0, 0.5]),
            confidence: 0.9,
        })
    }
}

/// What the fake executor does with one submission of a chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    /// Run the worker, report SUCCEEDED
    Succeed,
    /// Report FAILED without running the worker
    Fail,
    /// Report SUCCEEDED without running the worker
    SucceedWithoutManifest,
    /// Refuse the submission
    RejectSubmit,
    /// Accept the job, then fail every poll; cancelling succeeds
    LoseTrack,
    /// Accept the job, then fail every poll and every cancel
    LoseTrackUncancellable,
}

struct FakeJob {
    finish_at: Instant,
    outcome: JobState,
    reported: bool,
    step: Step,
}

/// Executor with scripted outcomes and a fixed job duration.
pub(crate) struct FakeExecutor {
    worker: ChunkWorker,
    duration: Duration,
    plans: Mutex<HashMap<u32, VecDeque<Step>>>,
    jobs: Mutex<HashMap<String, FakeJob>>,
    submissions: Mutex<Vec<(u32, Instant)>>,
    cancelled: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicU64,
}

impl FakeExecutor {
    pub(crate) fn new(store: Arc<dyn ArtifactStore>, duration: Duration) -> Self {
        Self::with_runner(store, UnitRunner::Pairs(Arc::new(ShiftAligner::new())), duration)
    }

    pub(crate) fn with_runner(
        store: Arc<dyn ArtifactStore>,
        runner: UnitRunner,
        duration: Duration,
    ) -> Self {
        Self {
            worker: ChunkWorker::new(store, runner, Metrics::new()),
            duration,
            plans: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    /// Script the next submissions of `chunk_id`; unscripted ones succeed.
    pub(crate) fn plan(&self, chunk_id: u32, steps: Vec<Step>) {
        self.plans.lock().unwrap().insert(chunk_id, steps.into());
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn submission_times(&self) -> Vec<Instant> {
        self.submissions.lock().unwrap().iter().map(|s| s.1).collect()
    }

    pub(crate) fn submitted_chunks(&self) -> Vec<u32> {
        self.submissions.lock().unwrap().iter().map(|s| s.0).collect()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn submit(&self, spec: &ChunkSpec) -> PipelineResult<JobId> {
        let now = Instant::now();
        self.submissions.lock().unwrap().push((spec.id(), now));
        let step = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&spec.id())
            .and_then(|p| p.pop_front())
            .unwrap_or(Step::Succeed);

        let outcome = match step {
            Step::RejectSubmit => {
                return Err(PipelineError::ChunkSubmission {
                    chunk_id: spec.id(),
                    reason: "queue full".to_string(),
                })
            }
            Step::Succeed => match self.worker.run(spec).await {
                Ok(_) => JobState::Succeeded,
                Err(_) => JobState::Failed,
            },
            Step::Fail | Step::LoseTrack | Step::LoseTrackUncancellable => JobState::Failed,
            Step::SucceedWithoutManifest => JobState::Succeeded,
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().unwrap().insert(
            id.clone(),
            FakeJob {
                finish_at: now + self.duration,
                outcome,
                reported: false,
                step,
            },
        );
        Ok(JobId(id))
    }

    async fn poll_state(&self, job: &JobId) -> PipelineResult<JobState> {
        let mut jobs = self.jobs.lock().unwrap();
        let fake = jobs
            .get_mut(&job.0)
            .ok_or_else(|| PipelineError::Executor(format!("unknown job {}", job)))?;
        if matches!(fake.step, Step::LoseTrack | Step::LoseTrackUncancellable) {
            return Err(PipelineError::Executor(format!("no such job {}", job)));
        }
        if Instant::now() < fake.finish_at {
            return Ok(JobState::Running);
        }
        if !fake.reported {
            fake.reported = true;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(fake.outcome)
    }

    async fn cancel(&self, job: &JobId) -> PipelineResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let fake = jobs
            .get_mut(&job.0)
            .ok_or_else(|| PipelineError::Executor(format!("unknown job {}", job)))?;
        if matches!(fake.step, Step::LoseTrackUncancellable) {
            return Err(PipelineError::Executor(format!("cannot reach {}", job)));
        }
        if !fake.reported {
            fake.reported = true;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        fake.outcome = JobState::Failed;
        self.cancelled.lock().unwrap().push(job.0.clone());
        Ok(())
    }
}
