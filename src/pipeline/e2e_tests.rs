//! End-to-end runs of a whole stage over sections on disk and an in-memory
//! artifact store.
//!
//! Covers:
//! 1. Coarse offsets over 25 sections in chunks of 10
//! 2. Re-running an unchanged stage
//! 3. A permanently failed chunk leaving a gap
//! 4. Registry write and backup failures
//! 5. Tile masks with the built-in smear masker

use crate::algorithm::UnitRunner;
use crate::config::tests::test_config;
use crate::config::{AlgorithmConfig, Config, RetryConfig, Stage};
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{Executor, LocalExecutor};
use crate::index::{PairKey, Tile, TileLayout, UnitKey, SECTION_LAYOUT_FILE};
use crate::io::{paths, ArtifactStore, ObjectArtifactStore, Registry, RegistryStore, UnitResult};
use crate::pipeline::testing::{FakeExecutor, ShiftAligner, Step};
use crate::pipeline::{BackupAndAuditor, ChunkWorker, CommitOutcome, Metrics};
use crate::{build_executor, run_stage_with};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn write_sections(dir: &Path, n: u32) {
    for i in 0..n {
        std::fs::create_dir_all(dir.join(format!("s{}_g0", i))).unwrap();
    }
}

fn write_layout(dir: &Path, num: u32, overlap: usize) {
    let layout = TileLayout {
        grid_shape: [2, 2],
        tile_height: 30,
        tile_width: 20,
        tile_overlap: overlap,
        tiles: (0..4)
            .map(|i| Tile {
                id: num * 10 + i,
                row: i / 2,
                col: i % 2,
                path: format!("tile_{}.tif", i),
            })
            .collect(),
    };
    let path = dir.join(format!("s{}_g0", num)).join(SECTION_LAYOUT_FILE);
    std::fs::write(path, serde_yaml::to_string(&layout).unwrap()).unwrap();
}

fn stage_config(dir: &Path, kind: Stage, n: u32, chunk_size: usize) -> Config {
    let mut config = test_config(kind);
    config.input.section_dir = dir.to_string_lossy().into_owned();
    config.input.end_section = n - 1;
    config.stage.chunk_size = chunk_size;
    config.processing.max_concurrent = 2;
    config.processing.submit_interval_ms = 5;
    config.processing.min_spacing_ms = 1;
    config.processing.enable_metrics = false;
    config.processing.retry = RetryConfig {
        retry_limit: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
    };
    config
}

fn local_shift_executor(store: &Arc<dyn ArtifactStore>, metrics: &Arc<Metrics>) -> Arc<dyn Executor> {
    let worker = ChunkWorker::new(
        store.clone(),
        UnitRunner::Pairs(Arc::new(ShiftAligner::new())),
        metrics.clone(),
    );
    Arc::new(LocalExecutor::new(Arc::new(worker)))
}

fn pair_key(from: u32) -> UnitKey {
    UnitKey::Pair(PairKey { from, to: from + 1 })
}

/// Artifact store whose writes under `fail_prefix` fail while `failing` is set.
struct FlakyStore {
    inner: ObjectArtifactStore,
    fail_prefix: &'static str,
    failing: AtomicBool,
}

impl FlakyStore {
    fn new(fail_prefix: &'static str) -> Self {
        Self {
            inner: ObjectArtifactStore::in_memory(),
            fail_prefix,
            failing: AtomicBool::new(false),
        }
    }

    fn check(&self, key: &str) -> PipelineResult<()> {
        if self.failing.load(Ordering::SeqCst) && key.starts_with(self.fail_prefix) {
            return Err(PipelineError::store(key, "injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FlakyStore {
    async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> PipelineResult<()> {
        self.check(key)?;
        self.inner.put(key, data).await
    }

    async fn put_new(&self, key: &str, data: Bytes) -> PipelineResult<bool> {
        self.check(key)?;
        self.inner.put_new(key, data).await
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

/// Scenario 1: N=25, S=10 gives chunks [0,10] [10,20] [20,24] and 24 ordered pairs.
#[tokio::test]
async fn test_coarse_offsets_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    write_sections(tmp.path(), 25);
    let config = stage_config(tmp.path(), Stage::CoarseOffsets, 25, 10);
    let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
    let metrics = Metrics::new();

    let report = run_stage_with(
        &config,
        store.clone(),
        local_shift_executor(&store, &metrics),
        metrics.clone(),
    )
    .await
    .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.scheduler.succeeded, vec![0, 1, 2]);
    assert_eq!(report.registry_entries, 24);
    assert_eq!(report.commit, CommitOutcome::Committed { backup: None });
    assert!(report.audit.is_clean(), "{:?}", report.audit.flagged);

    for id in 0..3 {
        assert!(store
            .get(&paths::chunk_spec(Stage::CoarseOffsets, id))
            .await
            .unwrap()
            .is_some());
    }

    let registry = RegistryStore::new(store.clone(), Stage::CoarseOffsets)
        .load()
        .await
        .unwrap()
        .unwrap();
    let keys: Vec<UnitKey> = registry.entries.iter().map(|e| e.key()).collect();
    assert_eq!(keys, (0..24).map(pair_key).collect::<Vec<_>>());
    assert!(registry.entries.iter().all(|e| e.is_resolved()));

    assert!(store.get(&paths::audit_json(Stage::CoarseOffsets)).await.unwrap().is_some());
    assert_eq!(metrics.snapshot().units_resolved, 24);
}

/// Scenario 2: a second run resumes every chunk and commits nothing new.
#[tokio::test]
async fn test_rerun_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    write_sections(tmp.path(), 25);
    let config = stage_config(tmp.path(), Stage::CoarseOffsets, 25, 10);
    let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
    let registry_key = paths::registry(Stage::CoarseOffsets);

    let metrics = Metrics::new();
    run_stage_with(&config, store.clone(), local_shift_executor(&store, &metrics), metrics)
        .await
        .unwrap();
    let first = store.get(&registry_key).await.unwrap().unwrap();

    let metrics = Metrics::new();
    let report = run_stage_with(
        &config,
        store.clone(),
        local_shift_executor(&store, &metrics),
        metrics,
    )
    .await
    .unwrap();

    assert!(report.is_success());
    assert_eq!(report.scheduler.resumed, vec![0, 1, 2]);
    assert!(report.scheduler.succeeded.is_empty());
    assert_eq!(report.scheduler.submissions, 0);
    assert_eq!(report.commit, CommitOutcome::Unchanged);
    assert_eq!(store.get(&registry_key).await.unwrap().unwrap(), first);
    assert!(store.list(&paths::backups(Stage::CoarseOffsets)).await.unwrap().is_empty());
}

/// Scenario 3: N=10, one of 9 pairs missing. The error names exactly that
/// pair and the committed registry is left as it was.
#[tokio::test(start_paused = true)]
async fn test_missing_pair_leaves_registry_unchanged() {
    let tmp = tempfile::tempdir().unwrap();
    write_sections(tmp.path(), 10);
    let mut config = stage_config(tmp.path(), Stage::CoarseOffsets, 10, 1);
    let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
    let registry_key = paths::registry(Stage::CoarseOffsets);

    let executor = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(20)));
    let report = run_stage_with(&config, store.clone(), executor, Metrics::new())
        .await
        .unwrap();
    assert_eq!(report.registry_entries, 9);
    let committed = store.get(&registry_key).await.unwrap().unwrap();

    config.processing.resume = false;
    let executor = Arc::new(FakeExecutor::new(store.clone(), Duration::from_millis(20)));
    executor.plan(4, vec![Step::Fail, Step::Fail, Step::Fail]);
    let err = run_stage_with(&config, store.clone(), executor, Metrics::new())
        .await
        .unwrap_err();

    match err {
        PipelineError::IncompleteAggregation {
            missing,
            conflicting,
            failed_chunks,
        } => {
            assert_eq!(missing, vec!["(4,5)".to_string()]);
            assert!(conflicting.is_empty());
            assert_eq!(failed_chunks, vec![4]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(store.get(&registry_key).await.unwrap().unwrap(), committed);
    assert!(store.list(&paths::backups(Stage::CoarseOffsets)).await.unwrap().is_empty());
}

fn registry_of(n: u32, dy: f64) -> Registry {
    let entries = (0..n)
        .map(|from| UnitResult::Pair {
            key: PairKey { from, to: from + 1 },
            outcome: crate::algorithm::UnitOutcome::Resolved(crate::algorithm::PairEstimate {
                transform: crate::algorithm::Transform::new(vec![dy, 0.0]),
                confidence: 0.9,
            }),
        })
        .collect();
    Registry::new(Stage::CoarseOffsets, entries).unwrap()
}

/// Scenario 4a: the registry write fails after a successful backup.
#[tokio::test]
async fn test_failed_registry_write_keeps_prior_registry_and_backup() {
    let flaky = Arc::new(FlakyStore::new("registry/"));
    let store: Arc<dyn ArtifactStore> = flaky.clone();
    let auditor = BackupAndAuditor::new(store.clone(), Stage::CoarseOffsets, Default::default());

    let prior = registry_of(5, 1.0);
    auditor.commit(&prior).await.unwrap();

    flaky.failing.store(true, Ordering::SeqCst);
    let err = auditor.commit(&registry_of(5, 2.0)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Store { .. }), "{:?}", err);

    let current = auditor.registry_store().load().await.unwrap().unwrap();
    assert_eq!(current, prior);

    let backups = auditor.registry_store().list_backups().await.unwrap();
    assert_eq!(backups.len(), 1);
    let backed_up = store.get(&backups[0]).await.unwrap().unwrap();
    assert_eq!(Registry::from_bytes(&backed_up).unwrap(), prior);
}

/// Scenario 4b: the backup cannot be written, so nothing is overwritten.
#[tokio::test]
async fn test_backup_failure_blocks_commit() {
    let flaky = Arc::new(FlakyStore::new("backups/"));
    let store: Arc<dyn ArtifactStore> = flaky.clone();
    let auditor = BackupAndAuditor::new(store.clone(), Stage::CoarseOffsets, Default::default());

    let prior = registry_of(3, 1.0);
    auditor.commit(&prior).await.unwrap();

    flaky.failing.store(true, Ordering::SeqCst);
    let err = auditor.commit(&registry_of(3, 2.0)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Backup(_)), "{:?}", err);
    assert_eq!(auditor.registry_store().load().await.unwrap(), Some(prior));
}

/// Scenario 5: tile masks over disjoint chunks, one section with too little
/// overlap for the smear band.
#[tokio::test]
async fn test_tile_masks_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    write_sections(tmp.path(), 5);
    for num in 0..5 {
        write_layout(tmp.path(), num, if num == 3 { 10 } else { 24 });
    }
    let mut config = stage_config(tmp.path(), Stage::TileMasks, 5, 2);
    config.algorithm = AlgorithmConfig::SmearOnly;
    config.mask.smear_extend = 20;

    let store: Arc<dyn ArtifactStore> = Arc::new(ObjectArtifactStore::in_memory());
    let metrics = Metrics::new();
    let executor = build_executor(&config, store.clone(), metrics.clone());
    let report = run_stage_with(&config, store.clone(), executor, metrics)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.scheduler.total_chunks, 3);
    assert_eq!(report.registry_entries, 20);
    assert_eq!(report.unresolved, 4);
    assert!(report.audit.flagged.is_empty());
    assert_eq!(report.audit.unresolved.len(), 4);
    assert!(report.audit.unresolved.iter().all(|u| u.key.starts_with("s3[")));

    let registry = RegistryStore::new(store, Stage::TileMasks)
        .load()
        .await
        .unwrap()
        .unwrap();
    for entry in &registry.entries {
        if let UnitResult::Tile {
            key,
            tile_id,
            outcome: crate::algorithm::UnitOutcome::Resolved(masks),
        } = entry
        {
            assert_eq!(*tile_id, key.section * 10 + key.row * 2 + key.col);
            assert_eq!(masks.smear.count(), 20 * 20);
            assert_eq!(masks.resin.count(), 0);
        }
    }
}
