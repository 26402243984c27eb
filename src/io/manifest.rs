//! Per-chunk result manifests.
//!
//! A manifest is the only artifact a worker produces. It is content-hashed
//! and bound to the chunk spec fingerprint it was computed from, so a resumed run
//! can tell a complete chunk from a stale or truncated one.

use super::artifact_store::{paths, ArtifactStore};
use super::sha256_hex;
use crate::algorithm::{EncodedMasks, PairEstimate, UnitOutcome};
use crate::config::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::index::{Chunk, ChunkSpec, PairKey, TileKey, UnitKey};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitResult {
    Pair {
        key: PairKey,
        outcome: UnitOutcome<PairEstimate>,
    },
    Tile {
        key: TileKey,
        tile_id: u32,
        outcome: UnitOutcome<EncodedMasks>,
    },
}

impl UnitResult {
    pub fn key(&self) -> UnitKey {
        match self {
            UnitResult::Pair { key, .. } => UnitKey::Pair(*key),
            UnitResult::Tile { key, .. } => UnitKey::Tile(*key),
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            UnitResult::Pair { outcome, .. } => outcome.is_resolved(),
            UnitResult::Tile { outcome, .. } => outcome.is_resolved(),
        }
    }

    pub fn unresolved_reason(&self) -> Option<&str> {
        match self {
            UnitResult::Pair {
                outcome: UnitOutcome::Unresolved { reason },
                ..
            }
            | UnitResult::Tile {
                outcome: UnitOutcome::Unresolved { reason },
                ..
            } => Some(reason),
            _ => None,
        }
    }
}

/// Hash of a sorted entry list.
pub(crate) fn entries_hash(entries: &[UnitResult]) -> PipelineResult<String> {
    Ok(sha256_hex(&serde_json::to_vec(entries)?))
}

/// Results of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub chunk: Chunk,
    pub stage: Stage,
    pub spec_fingerprint: String,
    pub entries: Vec<UnitResult>,
    pub content_hash: String,
}

impl ChunkManifest {
    pub fn new(spec: &ChunkSpec, mut entries: Vec<UnitResult>) -> PipelineResult<Self> {
        entries.sort_by_key(|e| e.key());
        let content_hash = entries_hash(&entries)?;
        Ok(Self {
            chunk: spec.chunk,
            stage: spec.stage,
            spec_fingerprint: spec.fingerprint.clone(),
            entries,
            content_hash,
        })
    }

    pub fn resolved_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_resolved()).count()
    }

    pub fn unresolved_count(&self) -> usize {
        self.entries.len() - self.resolved_count()
    }

    /// Check the manifest belongs to `spec` and has not been altered.
    pub fn validate(&self, spec: &ChunkSpec) -> PipelineResult<()> {
        let id = spec.id();
        if self.chunk != spec.chunk {
            return Err(PipelineError::manifest(
                id,
                format!("range mismatch: manifest has {}, spec has {}", self.chunk, spec.chunk),
            ));
        }
        if self.stage != spec.stage {
            return Err(PipelineError::manifest(
                id,
                format!("stage mismatch: {} vs {}", self.stage, spec.stage),
            ));
        }
        if self.spec_fingerprint != spec.fingerprint {
            return Err(PipelineError::manifest(id, "computed from a different chunk spec"));
        }
        if entries_hash(&self.entries)? != self.content_hash {
            return Err(PipelineError::manifest(id, "content hash mismatch"));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }
}

/// Reads and writes manifests in an [`ArtifactStore`].
#[derive(Clone)]
pub struct ManifestStore {
    store: Arc<dyn ArtifactStore>,
}

impl ManifestStore {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Write a manifest. A manifest is normally written once; an existing
    /// object with different content (a stale or corrupt leftover) is replaced.
    pub async fn write(&self, manifest: &ChunkManifest) -> PipelineResult<()> {
        let key = paths::manifest(manifest.stage, manifest.chunk.id);
        let bytes = manifest.to_bytes()?;

        if self.store.put_new(&key, bytes.clone()).await? {
            return Ok(());
        }
        if self.store.get(&key).await?.as_ref() == Some(&bytes) {
            return Ok(());
        }
        tracing::warn!("Replacing stale manifest {}", key);
        self.store.put(&key, bytes).await
    }

    /// Load a manifest without validating it against a spec.
    pub async fn load(&self, stage: Stage, chunk_id: u32) -> PipelineResult<Option<ChunkManifest>> {
        let key = paths::manifest(stage, chunk_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let manifest: ChunkManifest = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::manifest(chunk_id, format!("malformed: {}", e)))?;
        if manifest.chunk.id != chunk_id {
            return Err(PipelineError::manifest(
                chunk_id,
                format!("stored under chunk {} but names chunk {}", chunk_id, manifest.chunk.id),
            ));
        }
        Ok(Some(manifest))
    }

    /// Remove a chunk's manifest so the chunk is recomputed.
    pub async fn invalidate(&self, stage: Stage, chunk_id: u32) -> PipelineResult<()> {
        self.store.delete(&paths::manifest(stage, chunk_id)).await
    }

    /// `Ok(None)` if absent, `Err(Manifest)` if present but not valid for `spec`.
    pub async fn load_valid(&self, spec: &ChunkSpec) -> PipelineResult<Option<ChunkManifest>> {
        match self.load(spec.stage, spec.id()).await? {
            Some(manifest) => {
                manifest.validate(spec)?;
                Ok(Some(manifest))
            }
            None => Ok(None),
        }
    }
}
