//! Merge chunk manifests into one stage-wide registry.
//!
//! Pairwise chunks share their boundary section, so a key may in principle
//! be reported by more than one chunk. The copy computed deepest inside its
//! chunk wins; ties go to the lower chunk id. A chunk that reports two
//! different copies of one key makes that key conflicting. The result does
//! not depend on the order manifests are read in.

use crate::config::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::index::{Chunk, ChunkSpec, ConfigPartitioner, Section, UnitKey};
use crate::io::{ChunkManifest, ManifestStore, Registry, UnitResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A merged registry plus what was dropped on the way.
#[derive(Debug)]
pub struct Aggregation {
    pub registry: Registry,

    /// Entries recorded as unresolved
    pub unresolved: usize,

    /// Duplicate copies discarded in favour of a deeper one
    pub superseded: usize,

    /// Entries naming a key outside their chunk or the section list
    pub rejected: usize,
}

struct Candidate<'a> {
    depth: usize,
    chunk_id: u32,
    entry: &'a UnitResult,
}

impl Candidate<'_> {
    fn beats(&self, other: &Candidate<'_>) -> bool {
        self.depth > other.depth || (self.depth == other.depth && self.chunk_id < other.chunk_id)
    }
}

/// Builds the registry of one stage from chunk manifests.
pub struct ResultAggregator<'a> {
    sections: &'a [Section],
    stage: Stage,
    positions: HashMap<u32, usize>,
}

impl<'a> ResultAggregator<'a> {
    pub fn new(sections: &'a [Section], stage: Stage) -> Self {
        let positions = sections
            .iter()
            .enumerate()
            .map(|(p, s)| (s.num, p))
            .collect();
        Self {
            sections,
            stage,
            positions,
        }
    }

    /// Load the manifest of every chunk. Chunks without a valid manifest are
    /// returned by id.
    pub async fn collect(
        &self,
        manifests: &ManifestStore,
        specs: &[ChunkSpec],
    ) -> PipelineResult<(Vec<ChunkManifest>, Vec<u32>)> {
        let mut loaded = Vec::with_capacity(specs.len());
        let mut unavailable = Vec::new();
        for spec in specs {
            match manifests.load_valid(spec).await {
                Ok(Some(m)) => loaded.push(m),
                Ok(None) => {
                    tracing::warn!("{} has no manifest", spec.chunk);
                    unavailable.push(spec.id());
                }
                Err(e @ PipelineError::Manifest { .. }) => {
                    tracing::warn!("{}", e);
                    unavailable.push(spec.id());
                }
                Err(e) => return Err(e),
            }
        }
        Ok((loaded, unavailable))
    }

    /// Collect and merge. `failed_chunks` are reported if keys are missing.
    pub async fn aggregate(
        &self,
        manifests: &ManifestStore,
        specs: &[ChunkSpec],
        failed_chunks: &[u32],
    ) -> PipelineResult<Aggregation> {
        let (loaded, unavailable) = self.collect(manifests, specs).await?;
        let failed: BTreeSet<u32> = failed_chunks.iter().chain(&unavailable).copied().collect();
        self.merge(&loaded, &failed.into_iter().collect::<Vec<_>>())
    }

    /// Merge manifests into a registry, or fail with the keys that would be
    /// missing or conflicting.
    pub fn merge(
        &self,
        manifests: &[ChunkManifest],
        failed_chunks: &[u32],
    ) -> PipelineResult<Aggregation> {
        let mut candidates: BTreeMap<UnitKey, Vec<Candidate<'_>>> = BTreeMap::new();
        let mut rejected = 0;

        for manifest in manifests {
            if manifest.stage != self.stage {
                return Err(PipelineError::manifest(
                    manifest.chunk.id,
                    format!("belongs to stage {}, aggregating {}", manifest.stage, self.stage),
                ));
            }
            for entry in &manifest.entries {
                let key = entry.key();
                let Some(depth) = self.depth_in(&manifest.chunk, &key) else {
                    tracing::warn!("Ignoring {} from {}: outside its range", key, manifest.chunk);
                    rejected += 1;
                    continue;
                };
                candidates.entry(key).or_default().push(Candidate {
                    depth,
                    chunk_id: manifest.chunk.id,
                    entry,
                });
            }
        }

        // Decided per key over the full candidate set, so arrival order is
        // irrelevant. A chunk disagreeing with itself taints the key even
        // when another chunk would win it.
        let mut chosen: BTreeMap<UnitKey, &UnitResult> = BTreeMap::new();
        let mut conflicting: BTreeSet<UnitKey> = BTreeSet::new();
        let mut superseded = 0;
        for (key, mut copies) in candidates {
            copies.sort_by_key(|c| c.chunk_id);
            if copies
                .windows(2)
                .any(|w| w[0].chunk_id == w[1].chunk_id && w[0].entry != w[1].entry)
            {
                conflicting.insert(key);
                continue;
            }
            copies.dedup_by_key(|c| c.chunk_id);
            superseded += copies.len().saturating_sub(1);

            let best = copies
                .iter()
                .reduce(|best, c| if c.beats(best) { c } else { best });
            if let Some(best) = best {
                chosen.insert(key, best.entry);
            }
        }

        let missing: Vec<String> = ConfigPartitioner::expected_keys(self.sections, self.stage)
            .into_iter()
            .filter(|k| !chosen.contains_key(k) && !conflicting.contains(k))
            .map(|k| k.to_string())
            .collect();

        if !missing.is_empty() || !conflicting.is_empty() {
            let mut failed_chunks = failed_chunks.to_vec();
            failed_chunks.sort_unstable();
            failed_chunks.dedup();
            return Err(PipelineError::IncompleteAggregation {
                missing,
                conflicting: conflicting.iter().map(|k| k.to_string()).collect(),
                failed_chunks,
            });
        }
        if !failed_chunks.is_empty() {
            tracing::warn!(
                "Chunks {:?} failed but every key is covered by other chunks",
                failed_chunks
            );
        }

        let entries: Vec<UnitResult> = chosen.into_values().cloned().collect();
        let unresolved = entries.iter().filter(|e| !e.is_resolved()).count();
        let registry = Registry::new(self.stage, entries)?;

        tracing::info!(
            "Aggregated {} {} entries ({} unresolved, {} superseded, {} rejected)",
            registry.len(),
            self.stage,
            unresolved,
            superseded,
            rejected
        );
        Ok(Aggregation {
            registry,
            unresolved,
            superseded,
            rejected,
        })
    }

    /// Depth of `key` inside `chunk`, `None` if the chunk cannot own it.
    fn depth_in(&self, chunk: &Chunk, key: &UnitKey) -> Option<usize> {
        match key {
            UnitKey::Pair(k) => {
                let p = *self.positions.get(&k.from)?;
                if self.sections.get(p + 1)?.num != k.to {
                    return None;
                }
                chunk.pair_depth(p)
            }
            UnitKey::Tile(k) => {
                let p = *self.positions.get(&k.section)?;
                if !chunk.owned_range().contains(&p) {
                    return None;
                }
                chunk.section_depth(p)
            }
        }
    }
}
