//! Job submission and tracking for chunk processing.
//!
//! A single control loop owns all job state. Every `submit_interval` it
//! polls the in-flight jobs, then refills free slots in partition order,
//! keeping at most `max_concurrent` jobs in flight and at least
//! `min_spacing` between two submissions. Failed chunks are resubmitted with
//! exponential backoff until `retry_limit` is exhausted.

use crate::config::{ProcessingConfig, RetryConfig};
use crate::error::PipelineResult;
use crate::executor::{Executor, JobId, JobState};
use crate::index::ChunkSpec;
use crate::io::{ArtifactStore, JobStore, ManifestStore};
use crate::pipeline::{Metrics, MetricsReporter};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Consecutive poll errors after which a job is considered failed.
const MAX_POLL_ERRORS: u32 = 5;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum jobs in flight
    pub max_concurrent: usize,

    /// Control loop tick
    pub submit_interval: Duration,

    /// Minimum gap between two submissions
    pub min_spacing: Duration,

    pub retry: RetryConfig,

    /// Skip chunks completed by an earlier run
    pub resume: bool,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,
}

impl From<&ProcessingConfig> for SchedulerConfig {
    fn from(p: &ProcessingConfig) -> Self {
        Self {
            max_concurrent: p.max_concurrent,
            submit_interval: p.submit_interval(),
            min_spacing: p.min_spacing(),
            retry: p.retry.clone(),
            resume: p.resume,
            enable_metrics: p.enable_metrics,
            metrics_interval_secs: p.metrics_interval_secs,
            metrics_output_path: p.metrics_output_path.clone(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&ProcessingConfig::default())
    }
}

/// A chunk waiting for (re)submission.
struct Queued {
    idx: usize,
    /// Attempts made so far
    attempts: u32,
    not_before: Option<Instant>,
}

/// A submitted chunk job.
struct InFlight {
    idx: usize,
    attempts: u32,
    job: JobId,
    seen_running: bool,
    poll_errors: u32,
}

/// A chunk that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedChunk {
    pub chunk_id: u32,
    pub attempts: u32,
    pub last_error: String,
}

/// Outcome of a scheduler run.
#[derive(Debug, Default, Serialize)]
pub struct SchedulerReport {
    pub run_id: String,
    pub total_chunks: usize,

    /// Completed in this run
    pub succeeded: Vec<u32>,

    /// Completed by an earlier run
    pub resumed: Vec<u32>,

    pub failed: Vec<FailedChunk>,

    /// Submissions, retries included
    pub submissions: u32,
}

impl SchedulerReport {
    /// Every chunk has a valid manifest.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.succeeded.len() + self.resumed.len() == self.total_chunks
    }

    pub fn failed_ids(&self) -> Vec<u32> {
        self.failed.iter().map(|f| f.chunk_id).collect()
    }
}

impl std::fmt::Display for SchedulerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Succeeded: {}, Resumed: {}, Failed: {}, Total: {}, Submissions: {}",
            self.succeeded.len(),
            self.resumed.len(),
            self.failed.len(),
            self.total_chunks,
            self.submissions
        )
    }
}

/// Drives chunk jobs through an [`Executor`].
pub struct ChunkScheduler {
    executor: Arc<dyn Executor>,
    store: Arc<dyn ArtifactStore>,
    manifests: ManifestStore,
    jobs: JobStore,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl ChunkScheduler {
    pub fn new(
        executor: Arc<dyn Executor>,
        store: Arc<dyn ArtifactStore>,
        jobs: JobStore,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            manifests: ManifestStore::new(store.clone()),
            store,
            jobs,
            metrics,
            config,
        }
    }

    /// Run every chunk to a terminal state.
    ///
    /// Returns once no job is in flight. Permanently failed chunks are listed
    /// in the report rather than returned as an error; errors are reserved
    /// for the artifact store itself.
    pub async fn run(&mut self, specs: &[ChunkSpec]) -> PipelineResult<SchedulerReport> {
        let mut report = SchedulerReport {
            run_id: self.jobs.run_id().to_string(),
            total_chunks: specs.len(),
            ..Default::default()
        };
        let mut queue = self.initial_queue(specs, &mut report).await?;

        tracing::info!(
            "Scheduling {} chunks ({} resumed), max {} concurrent, {:?} spacing",
            queue.len(),
            report.resumed.len(),
            self.config.max_concurrent,
            self.config.min_spacing
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                specs.len() as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut running: Vec<InFlight> = Vec::new();
        let mut last_submit: Option<Instant> = None;
        let mut ticker = tokio::time::interval(self.config.submit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = async {
            while !(queue.is_empty() && running.is_empty()) {
                ticker.tick().await;
                self.poll_running(specs, &mut running, &mut queue, &mut report)
                    .await?;
                self.fill_slots(specs, &mut running, &mut queue, &mut last_submit, &mut report)
                    .await?;
            }
            PipelineResult::Ok(())
        }
        .await;

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }
        result?;

        if self.config.enable_metrics {
            MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                specs.len() as u64,
            )
            .print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        report.succeeded.sort_unstable();
        report.failed.sort_by_key(|f| f.chunk_id);
        tracing::info!("Scheduler finished: {}", report);
        Ok(report)
    }

    /// Decide which chunks need a job, recording resumed ones.
    async fn initial_queue(
        &mut self,
        specs: &[ChunkSpec],
        report: &mut SchedulerReport,
    ) -> PipelineResult<Vec<Queued>> {
        let history = if self.config.resume {
            JobStore::load_succeeded(self.store.as_ref(), specs).await?
        } else {
            BTreeMap::new()
        };

        let mut queue = Vec::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            if !self.config.resume {
                self.manifests.invalidate(spec.stage, spec.id()).await?;
            } else {
                match self.manifests.load_valid(spec).await {
                    Ok(Some(manifest)) => {
                        let recorded = history
                            .get(&spec.id())
                            .and_then(|r| r.manifest_hash.as_deref());
                        if recorded.map_or(true, |h| h == manifest.content_hash) {
                            let record = self
                                .jobs
                                .record(spec, 0, JobState::Succeeded)
                                .with_manifest_hash(&manifest.content_hash)
                                .resumed();
                            self.jobs.append(record).await?;
                            self.metrics.add_chunk_resumed();
                            report.resumed.push(spec.id());
                            continue;
                        }
                        tracing::warn!(
                            "{}: manifest differs from the one recorded at completion, recomputing",
                            spec.chunk
                        );
                        self.manifests.invalidate(spec.stage, spec.id()).await?;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("{}, recomputing", e),
                }
            }
            queue.push(Queued {
                idx,
                attempts: 0,
                not_before: None,
            });
        }
        Ok(queue)
    }

    async fn poll_running(
        &mut self,
        specs: &[ChunkSpec],
        running: &mut Vec<InFlight>,
        queue: &mut Vec<Queued>,
        report: &mut SchedulerReport,
    ) -> PipelineResult<()> {
        let mut i = 0;
        while i < running.len() {
            let spec = &specs[running[i].idx];
            let state = match self.executor.poll_state(&running[i].job).await {
                Ok(state) => state,
                Err(e) => {
                    running[i].poll_errors += 1;
                    if running[i].poll_errors < MAX_POLL_ERRORS {
                        tracing::warn!("{}: poll failed: {}", spec.chunk, e);
                        i += 1;
                        continue;
                    }
                    let job = running.remove(i);
                    if let Err(cancel) = self.executor.cancel(&job.job).await {
                        // a second job would race this one for the chunk's manifest
                        tracing::error!("{}: cannot cancel {}: {}", spec.chunk, job.job, cancel);
                        let reason = format!("lost track of {} ({}) and could not cancel it", job.job, e);
                        self.fail_permanently(spec, job.attempts, reason, report).await?;
                        continue;
                    }
                    self.handle_failure(spec, job.idx, job.attempts, e.to_string(), queue, report)
                        .await?;
                    continue;
                }
            };
            running[i].poll_errors = 0;

            match state {
                JobState::Pending => i += 1,
                JobState::Running => {
                    if !running[i].seen_running {
                        running[i].seen_running = true;
                        let record = self
                            .jobs
                            .record(spec, running[i].attempts, JobState::Running)
                            .with_job_id(running[i].job.0.clone());
                        self.jobs.append(record).await?;
                    }
                    i += 1;
                }
                JobState::Succeeded => {
                    let job = running.remove(i);
                    match self.manifests.load_valid(spec).await {
                        Ok(Some(manifest)) => {
                            let record = self
                                .jobs
                                .record(spec, job.attempts, JobState::Succeeded)
                                .with_job_id(job.job.0.clone())
                                .with_manifest_hash(&manifest.content_hash);
                            self.jobs.append(record).await?;
                            self.metrics.add_chunk_succeeded();
                            report.succeeded.push(spec.id());
                            tracing::debug!("{} succeeded (attempt {})", spec.chunk, job.attempts);
                        }
                        Ok(None) => {
                            let reason = format!("job {} succeeded but wrote no manifest", job.job);
                            self.handle_failure(spec, job.idx, job.attempts, reason, queue, report)
                                .await?;
                        }
                        Err(e) => {
                            self.handle_failure(spec, job.idx, job.attempts, e.to_string(), queue, report)
                                .await?;
                        }
                    }
                }
                JobState::Failed => {
                    let job = running.remove(i);
                    let reason = format!("job {} failed", job.job);
                    self.handle_failure(spec, job.idx, job.attempts, reason, queue, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn fill_slots(
        &mut self,
        specs: &[ChunkSpec],
        running: &mut Vec<InFlight>,
        queue: &mut Vec<Queued>,
        last_submit: &mut Option<Instant>,
        report: &mut SchedulerReport,
    ) -> PipelineResult<()> {
        while running.len() < self.config.max_concurrent {
            let now = Instant::now();
            let Some(pos) = queue
                .iter()
                .position(|q| q.not_before.map_or(true, |t| t <= now))
            else {
                break;
            };

            if let Some(last) = *last_submit {
                let ready = last + self.config.min_spacing;
                if ready > now {
                    tokio::time::sleep_until(ready).await;
                }
            }

            let item = queue.remove(pos);
            let attempts = item.attempts + 1;
            let spec = &specs[item.idx];
            *last_submit = Some(Instant::now());
            report.submissions += 1;
            self.metrics.add_chunk_submitted();

            match self.executor.submit(spec).await {
                Ok(job) => {
                    let record = self
                        .jobs
                        .record(spec, attempts, JobState::Pending)
                        .with_job_id(job.0.clone());
                    self.jobs.append(record).await?;
                    tracing::debug!("Submitted {} as {} (attempt {})", spec.chunk, job, attempts);
                    running.push(InFlight {
                        idx: item.idx,
                        attempts,
                        job,
                        seen_running: false,
                        poll_errors: 0,
                    });
                }
                Err(e) => {
                    self.handle_failure(spec, item.idx, attempts, e.to_string(), queue, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Requeue with backoff, or give up once retries are exhausted.
    async fn handle_failure(
        &mut self,
        spec: &ChunkSpec,
        idx: usize,
        attempts: u32,
        reason: String,
        queue: &mut Vec<Queued>,
        report: &mut SchedulerReport,
    ) -> PipelineResult<()> {
        if attempts <= self.config.retry.retry_limit {
            let record = self.jobs.record(spec, attempts, JobState::Failed);
            let backoff = self.config.retry.backoff(attempts);
            tracing::warn!(
                "{} attempt {} failed: {}; retrying in {:?}",
                spec.chunk,
                attempts,
                reason,
                backoff
            );
            self.jobs.append(record.with_message(reason)).await?;
            self.metrics.add_retry();

            let pos = queue.partition_point(|q| q.idx < idx);
            queue.insert(
                pos,
                Queued {
                    idx,
                    attempts,
                    not_before: Some(Instant::now() + backoff),
                },
            );
        } else {
            self.fail_permanently(spec, attempts, reason, report).await?;
        }
        Ok(())
    }

    async fn fail_permanently(
        &mut self,
        spec: &ChunkSpec,
        attempts: u32,
        reason: String,
        report: &mut SchedulerReport,
    ) -> PipelineResult<()> {
        tracing::error!(
            "{} failed permanently after {} attempt(s): {}",
            spec.chunk,
            attempts,
            reason
        );
        let record = self.jobs.record(spec, attempts, JobState::Failed);
        self.jobs
            .append(record.with_message(format!("giving up: {}", reason)))
            .await?;
        self.metrics.add_chunk_failed();
        report.failed.push(FailedChunk {
            chunk_id: spec.id(),
            attempts,
            last_error: reason,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;
    use crate::io::ObjectArtifactStore;
    use crate::pipeline::testing::{pair_specs, FakeExecutor, Step};

    fn config(max_concurrent: usize, spacing_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent,
            submit_interval: Duration::from_millis(50),
            min_spacing: Duration::from_millis(spacing_ms),
            retry: RetryConfig {
                retry_limit: 2,
                initial_backoff_ms: 200,
                max_backoff_ms: 1_000,
            },
            resume: true,
            enable_metrics: false,
            metrics_interval_secs: 30,
            metrics_output_path: None,
        }
    }

    fn scheduler(
        store: &Arc<dyn ArtifactStore>,
        executor: Arc<FakeExecutor>,
        config: SchedulerConfig,
        run_id: &str,
    ) -> ChunkScheduler {
        ChunkScheduler::new(
            executor,
            store.clone(),
            JobStore::new(store.clone(), run_id, Stage::CoarseOffsets),
            Metrics::new(),
            config,
        )
    }

    #[test]
    fn test_scheduler_config_from_processing() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.submit_interval, Duration::from_millis(1000));
        assert_eq!(config.min_spacing, Duration::from_millis(500));
        assert_eq!(config.retry.retry_limit, 2);
        assert!(config.resume);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_and_spacing_bounds() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let specs = pair_specs(25, 3);
        let executor = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(400)));

        let report = scheduler(&store, executor.clone(), config(2, 100), "run-1")
            .run(&specs)
            .await
            .unwrap();

        assert!(report.is_complete(), "{}", report);
        assert_eq!(report.succeeded.len(), specs.len());
        assert!(executor.max_in_flight() <= 2);
        assert_eq!(executor.max_in_flight(), 2);

        let times = executor.submission_times();
        assert_eq!(times.len(), specs.len());
        for w in times.windows(2) {
            assert!(w[1] - w[0] >= Duration::from_millis(100), "{:?}", w[1] - w[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_order_follows_partition() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let specs = pair_specs(12, 2);
        let executor = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));

        scheduler(&store, executor.clone(), config(3, 10), "run-1")
            .run(&specs)
            .await
            .unwrap();

        let order = executor.submitted_chunks();
        assert_eq!(order, (0..specs.len() as u32).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_permanent_failure() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let specs = pair_specs(10, 3);
        let executor = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));
        executor.plan(0, vec![Step::RejectSubmit, Step::Succeed]);
        executor.plan(1, vec![Step::Fail, Step::Fail, Step::Succeed]);
        executor.plan(2, vec![Step::Fail, Step::SucceedWithoutManifest, Step::Fail]);

        let report = scheduler(&store, executor.clone(), config(2, 10), "run-1")
            .run(&specs)
            .await
            .unwrap();

        assert_eq!(report.succeeded, vec![0, 1]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].chunk_id, 2);
        assert_eq!(report.failed[0].attempts, 3);
        assert!(!report.is_complete());
        // 2 + 3 + 3
        assert_eq!(report.submissions, 8);

        let records = JobStore::load_all(store.as_ref()).await.unwrap();
        let chunk2_failures = records
            .iter()
            .filter(|r| r.chunk_id == 2 && r.state == JobState::Failed)
            .count();
        assert_eq!(chunk2_failures, 3);
        assert!(records
            .iter()
            .any(|r| r.chunk_id == 2 && r.message.as_deref().is_some_and(|m| m.contains("no manifest"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpollable_job_is_cancelled_before_resubmit() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let specs = pair_specs(7, 3);
        let executor = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));
        executor.plan(0, vec![Step::LoseTrack, Step::Succeed]);
        executor.plan(1, vec![Step::LoseTrackUncancellable]);

        let report = scheduler(&store, executor.clone(), config(2, 10), "run-1")
            .run(&specs)
            .await
            .unwrap();

        assert_eq!(report.succeeded, vec![0]);
        assert_eq!(report.failed_ids(), vec![1]);
        assert_eq!(report.failed[0].attempts, 1);
        assert!(report.failed[0].last_error.contains("could not cancel"));

        // chunk 0's first job was cancelled before its second submission;
        // chunk 1 was never submitted again
        assert_eq!(executor.cancelled().len(), 1);
        assert_eq!(executor.submitted_chunks(), vec![0, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_backoff() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let specs = pair_specs(4, 10);
        let executor = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));
        executor.plan(0, vec![Step::Fail, Step::Succeed]);

        scheduler(&store, executor.clone(), config(1, 0), "run-1")
            .run(&specs)
            .await
            .unwrap();

        let times = executor.submission_times();
        assert_eq!(times.len(), 2);
        // job runtime plus the first backoff
        assert!(times[1] - times[0] >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_skips_completed_chunks() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let specs = pair_specs(25, 10);
        let first = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));
        first.plan(1, vec![Step::Fail, Step::Fail, Step::Fail]);

        let report = scheduler(&store, first, config(2, 10), "run-1")
            .run(&specs)
            .await
            .unwrap();
        assert_eq!(report.failed_ids(), vec![1]);

        let second = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));
        let report = scheduler(&store, second.clone(), config(2, 10), "run-2")
            .run(&specs)
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.resumed, vec![0, 2]);
        assert_eq!(report.succeeded, vec![1]);
        assert_eq!(second.submitted_chunks(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_disabled_recomputes() {
        let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
        let specs = pair_specs(8, 4);
        let first = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));
        scheduler(&store, first, config(2, 10), "run-1").run(&specs).await.unwrap();

        let second = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(100)));
        let mut cfg = config(2, 10);
        cfg.resume = false;
        let report = scheduler(&store, second.clone(), cfg, "run-2").run(&specs).await.unwrap();
        assert!(report.resumed.is_empty());
        assert_eq!(second.submitted_chunks().len(), specs.len());
    }

    #[test]
    fn test_report_display() {
        let report = SchedulerReport {
            run_id: "r".to_string(),
            total_chunks: 3,
            succeeded: vec![0],
            resumed: vec![1],
            failed: vec![FailedChunk {
                chunk_id: 2,
                attempts: 3,
                last_error: "boom".to_string(),
            }],
            submissions: 4,
        };
        let display = format!("{}", report);
        assert!(display.contains("Failed: 1"));
        assert!(display.contains("Total: 3"));
        assert_eq!(report.failed_ids(), vec![2]);
    }
}
