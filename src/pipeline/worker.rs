//! Chunk worker: computes every unit of one chunk and writes its manifest.
//!
//! Units are evaluated in parallel on the rayon pool. A unit the algorithm
//! cannot handle (or that panics) is recorded as unresolved; only storage
//! failures fail the chunk.

use crate::algorithm::{EncodedMasks, UnitOutcome, UnitRunner};
use crate::config::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::index::ChunkSpec;
use crate::io::{ArtifactStore, ChunkManifest, ManifestStore, UnitResult};
use crate::pipeline::Metrics;
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Result of running a worker on one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Units computed and manifest written
    Computed {
        resolved: usize,
        unresolved: usize,
        content_hash: String,
    },
    /// A valid manifest for this exact spec already existed
    AlreadyComplete { content_hash: String },
}

/// Processes chunk specs.
pub struct ChunkWorker {
    manifests: ManifestStore,
    runner: UnitRunner,
    metrics: Arc<Metrics>,
}

impl ChunkWorker {
    pub fn new(store: Arc<dyn ArtifactStore>, runner: UnitRunner, metrics: Arc<Metrics>) -> Self {
        Self {
            manifests: ManifestStore::new(store),
            runner,
            metrics,
        }
    }

    /// Load a spec written by `partition` and run it.
    pub async fn run_file(&self, path: &Path) -> PipelineResult<WorkerOutcome> {
        let yaml = tokio::fs::read_to_string(path).await?;
        let spec = ChunkSpec::from_yaml(&yaml)?;
        self.run(&spec).await
    }

    /// Process one chunk. Re-running a completed chunk is a no-op.
    pub async fn run(&self, spec: &ChunkSpec) -> PipelineResult<WorkerOutcome> {
        spec.verify()?;
        match (&self.runner, spec.stage) {
            (UnitRunner::Pairs(_), Stage::CoarseOffsets) | (UnitRunner::Masks(_), Stage::TileMasks) => {}
            _ => {
                return Err(PipelineError::config(format!(
                    "configured algorithm cannot run stage {}",
                    spec.stage
                )))
            }
        }

        match self.manifests.load_valid(spec).await {
            Ok(Some(existing)) => {
                tracing::debug!("{} already complete, skipping", spec.chunk);
                return Ok(WorkerOutcome::AlreadyComplete {
                    content_hash: existing.content_hash,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Recomputing {}: {}", spec.chunk, e),
        }

        let compute_start = Instant::now();
        let runner = self.runner.clone();
        let owned = spec.clone();
        let entries = tokio::task::spawn_blocking(move || compute_units(&runner, &owned))
            .await
            .map_err(|e| PipelineError::UnitCompute {
                unit: spec.chunk.to_string(),
                reason: format!("compute task failed: {}", e),
            })?;
        self.metrics.add_compute_time(compute_start.elapsed());

        let manifest = ChunkManifest::new(spec, entries)?;
        let resolved = manifest.resolved_count();
        let unresolved = manifest.unresolved_count();

        let write_start = Instant::now();
        self.manifests.write(&manifest).await?;
        self.metrics.add_manifest_write_time(write_start.elapsed());
        self.metrics.add_bytes_written(manifest.to_bytes()?.len() as u64);
        self.metrics.add_units(resolved as u64, unresolved as u64);

        if unresolved > 0 {
            tracing::info!(
                "{}: {} resolved, {} unresolved",
                spec.chunk,
                resolved,
                unresolved
            );
        } else {
            tracing::debug!("{}: {} resolved", spec.chunk, resolved);
        }

        Ok(WorkerOutcome::Computed {
            resolved,
            unresolved,
            content_hash: manifest.content_hash,
        })
    }
}

fn guarded<T>(f: impl FnOnce() -> UnitOutcome<T>) -> UnitOutcome<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| UnitOutcome::unresolved("algorithm panicked"))
}

/// Evaluate all units of `spec`. Output order follows unit order.
fn compute_units(runner: &UnitRunner, spec: &ChunkSpec) -> Vec<UnitResult> {
    match runner {
        UnitRunner::Pairs(aligner) => spec
            .pair_units()
            .par_iter()
            .map(|(_, key, a, b)| UnitResult::Pair {
                key: *key,
                outcome: guarded(|| aligner.compute_pair(a, b, &spec.params)),
            })
            .collect(),
        UnitRunner::Masks(masker) => spec
            .tile_units()
            .par_iter()
            .map(|(key, section, tile)| {
                let outcome = match section.layout.as_ref() {
                    Some(layout) => guarded(|| masker.compute_mask(section, layout, tile, &spec.params)),
                    None => UnitOutcome::unresolved("section has no tile layout"),
                };
                UnitResult::Tile {
                    key: *key,
                    tile_id: tile.id,
                    outcome: outcome.map(|m| EncodedMasks::from(&m)),
                }
            })
            .collect(),
    }
}
