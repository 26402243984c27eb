//! SBEM Prep
//!
//! Chunked, resumable preprocessing for serial-section EM alignment. The two
//! stages that dominate cluster time, per-tile masking and coarse pairwise
//! offsets, run through the same pipeline.
//!
//! # Architecture
//!
//! - **Index**: section discovery, partitioning into chunks, chunk specs
//! - **Executor**: where chunks run (in-process or one command per chunk)
//! - **Algorithm**: the per-pair / per-tile primitives, behind traits
//! - **I/O**: manifests, job records and the registry in an `object_store`
//! - **Pipeline**: worker, scheduler, aggregation, backup and audit
//!
//! # Usage
//!
//! ```no_run
//! use sbem_prep::{run_stage, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_stage(config).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod algorithm;
pub mod config;
pub mod error;
pub mod executor;
pub mod index;
pub mod io;
pub mod pipeline;

pub use config::{AlgorithmConfig, Config, ExecutorConfig, Stage};
pub use error::{PipelineError, PipelineResult};
pub use index::{ChunkSpec, ConfigPartitioner, Section, SectionListLoader};
pub use io::{ArtifactStore, Registry};
pub use pipeline::{
    BackupAndAuditor, ChunkScheduler, ChunkWorker, CommitOutcome, Metrics, OutlierReport,
    ResultAggregator, SchedulerConfig, SchedulerReport,
};

use algorithm::{CommandAlgorithm, SmearOnlyMasker, UnitRunner};
use anyhow::{Context, Result};
use bytes::Bytes;
use executor::{CommandExecutor, Executor, LocalExecutor};
use io::{paths, JobStore, ManifestStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one stage run.
#[derive(Debug)]
pub struct RunReport {
    pub stage: Stage,
    pub scheduler: SchedulerReport,
    pub registry_entries: usize,
    pub unresolved: usize,
    pub commit: CommitOutcome,
    pub audit: OutlierReport,
}

impl RunReport {
    /// Every chunk succeeded and the registry was committed.
    pub fn is_success(&self) -> bool {
        self.scheduler.is_complete()
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} run {}: {}; registry {} entries ({} unresolved), {}; audit {}",
            self.stage,
            self.scheduler.run_id,
            self.scheduler,
            self.registry_entries,
            self.unresolved,
            match self.commit {
                CommitOutcome::Unchanged => "unchanged",
                CommitOutcome::Committed { .. } => "committed",
            },
            self.audit
        )
    }
}

/// The unit primitive for the configured stage and algorithm.
pub fn build_runner(config: &Config) -> UnitRunner {
    match (&config.algorithm, config.stage.kind) {
        (AlgorithmConfig::Command { program, args, timeout_secs }, stage) => {
            let algorithm = Arc::new(
                CommandAlgorithm::new(program.clone(), args.clone())
                    .with_timeout(Duration::from_secs(*timeout_secs)),
            );
            match stage {
                Stage::CoarseOffsets => UnitRunner::Pairs(algorithm),
                Stage::TileMasks => UnitRunner::Masks(algorithm),
            }
        }
        (AlgorithmConfig::SmearOnly, _) => {
            UnitRunner::Masks(Arc::new(SmearOnlyMasker::new(config.mask.smear_extend)))
        }
    }
}

/// The executor backend selected by `config.executor`.
pub fn build_executor(
    config: &Config,
    store: Arc<dyn ArtifactStore>,
    metrics: Arc<Metrics>,
) -> Arc<dyn Executor> {
    match &config.executor {
        ExecutorConfig::Local => {
            let worker = ChunkWorker::new(store, build_runner(config), metrics);
            Arc::new(LocalExecutor::new(Arc::new(worker)))
        }
        ExecutorConfig::Command { program, args } => {
            Arc::new(CommandExecutor::new(program.clone(), args.clone(), spec_dir(config)))
        }
    }
}

/// Local directory the command executor writes chunk specs into.
fn spec_dir(config: &Config) -> PathBuf {
    let stage = config.stage.kind.as_str();
    match &config.output.local_path {
        Some(root) => PathBuf::from(root).join("chunks").join(stage),
        None => std::env::temp_dir().join("sbem-prep").join(stage),
    }
}

/// Load the sections, partition them and store one chunk spec per chunk.
pub async fn prepare_chunks(
    config: &Config,
    store: &dyn ArtifactStore,
) -> PipelineResult<(Vec<Section>, Vec<ChunkSpec>)> {
    let stage = config.stage.kind;
    let sections = SectionListLoader::load(&config.input, stage == Stage::TileMasks)?.into_sections();
    let params = config.algorithm_params()?;
    let specs = ConfigPartitioner::partition(&sections, stage, config.stage.chunk_size, &params)?;

    for spec in &specs {
        store
            .put(&paths::chunk_spec(stage, spec.id()), Bytes::from(spec.to_yaml()?))
            .await?;
    }
    tracing::info!("Wrote {} chunk specs for {}", specs.len(), stage);
    Ok((sections, specs))
}

/// Run one stage on `executor`: partition, schedule, aggregate, commit, audit.
///
/// Aggregation gaps are returned as [`PipelineError::IncompleteAggregation`]
/// and leave the committed registry untouched.
pub async fn run_stage_with(
    config: &Config,
    store: Arc<dyn ArtifactStore>,
    executor: Arc<dyn Executor>,
    metrics: Arc<Metrics>,
) -> PipelineResult<RunReport> {
    let stage = config.stage.kind;
    let (sections, specs) = prepare_chunks(config, store.as_ref()).await?;

    let jobs = JobStore::new(store.clone(), JobStore::new_run_id(stage), stage);
    let mut scheduler = ChunkScheduler::new(
        executor,
        store.clone(),
        jobs,
        metrics,
        SchedulerConfig::from(&config.processing),
    );
    let scheduled = scheduler.run(&specs).await?;
    for failed in &scheduled.failed {
        tracing::error!(
            "chunk {} failed after {} attempt(s): {}",
            failed.chunk_id,
            failed.attempts,
            failed.last_error
        );
    }

    let aggregation = ResultAggregator::new(&sections, stage)
        .aggregate(&ManifestStore::new(store.clone()), &specs, &scheduled.failed_ids())
        .await?;

    let auditor = BackupAndAuditor::new(store, stage, config.audit.clone());
    let commit = auditor.commit(&aggregation.registry).await?;
    let audit = auditor.audit(&aggregation.registry);
    auditor.write_report(&audit).await?;

    Ok(RunReport {
        stage,
        scheduler: scheduled,
        registry_entries: aggregation.registry.len(),
        unresolved: aggregation.unresolved,
        commit,
        audit,
    })
}

/// Run the configured stage against the configured store and executor.
pub async fn run_stage(config: Config) -> Result<RunReport> {
    config.validate()?;

    tracing::info!("Starting {} stage", config.stage.kind);
    tracing::info!("Writing artifacts to: {}", config.output.path_display());

    let store = io::open_artifact_store(&config)?;
    let metrics = Metrics::new();
    let executor = build_executor(&config, store.clone(), metrics.clone());

    let report = run_stage_with(&config, store, executor, metrics)
        .await
        .with_context(|| format!("{} stage failed", config.stage.kind))?;

    tracing::info!("Stage complete: {}", report);
    Ok(report)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_build_runner_follows_stage() {
        let config = test_config(Stage::CoarseOffsets);
        assert!(matches!(build_runner(&config), UnitRunner::Pairs(_)));

        let config = test_config(Stage::TileMasks);
        assert!(matches!(build_runner(&config), UnitRunner::Masks(_)));

        let mut config = test_config(Stage::TileMasks);
        config.algorithm = AlgorithmConfig::SmearOnly;
        assert!(matches!(build_runner(&config), UnitRunner::Masks(_)));
    }

    #[test]
    fn test_spec_dir() {
        let mut config = test_config(Stage::TileMasks);
        assert_eq!(spec_dir(&config), PathBuf::from("/tmp/sbem-prep/chunks/tile_masks"));

        config.output.local_path = None;
        assert!(spec_dir(&config).ends_with("sbem-prep/tile_masks"));
    }
}
