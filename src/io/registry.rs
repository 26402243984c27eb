//! The committed, stage-wide result registry and its backups.

use super::artifact_store::{paths, ArtifactStore};
use super::manifest::{entries_hash, UnitResult};
use super::sha256_hex;
use crate::config::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::index::UnitKey;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stage-wide mapping from unit key to result, sorted by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub stage: Stage,
    pub entries: Vec<UnitResult>,
    pub content_hash: String,
}

impl Registry {
    pub fn new(stage: Stage, mut entries: Vec<UnitResult>) -> PipelineResult<Self> {
        entries.sort_by_key(|e| e.key());
        let content_hash = entries_hash(&entries)?;
        Ok(Self {
            stage,
            entries,
            content_hash,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &UnitKey) -> Option<&UnitResult> {
        self.entries
            .binary_search_by_key(key, |e| e.key())
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Keys recorded as unresolved, with their reasons.
    pub fn unresolved(&self) -> Vec<(UnitKey, &str)> {
        self.entries
            .iter()
            .filter_map(|e| e.unresolved_reason().map(|r| (e.key(), r)))
            .collect()
    }

    pub fn to_bytes(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> PipelineResult<Self> {
        let registry: Registry = serde_json::from_slice(bytes)?;
        if entries_hash(&registry.entries)? != registry.content_hash {
            return Err(PipelineError::Serialization(
                "registry content hash mismatch".to_string(),
            ));
        }
        Ok(registry)
    }
}

/// A verified registry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRecord {
    pub path: String,
    /// SHA-256 of the backed-up bytes
    pub sha256: String,
    pub size: usize,
}

/// Access to the committed registry of one stage.
#[derive(Clone)]
pub struct RegistryStore {
    store: Arc<dyn ArtifactStore>,
    stage: Stage,
}

impl RegistryStore {
    pub fn new(store: Arc<dyn ArtifactStore>, stage: Stage) -> Self {
        Self { store, stage }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn key(&self) -> String {
        paths::registry(self.stage)
    }

    /// Raw bytes of the committed registry.
    pub async fn load_raw(&self) -> PipelineResult<Option<Bytes>> {
        self.store.get(&self.key()).await
    }

    pub async fn load(&self) -> PipelineResult<Option<Registry>> {
        match self.load_raw().await? {
            Some(bytes) => Ok(Some(Registry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Snapshot the committed registry under a timestamped, content-addressed
    /// name and read it back. `None` when there is nothing to back up.
    ///
    /// Every failure is reported as [`PipelineError::Backup`].
    pub async fn backup(&self) -> PipelineResult<Option<BackupRecord>> {
        let current = self
            .load_raw()
            .await
            .map_err(|e| PipelineError::Backup(format!("cannot read current registry: {}", e)))?;
        let Some(current) = current else {
            return Ok(None);
        };

        let sha256 = sha256_hex(&current);
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let path = paths::backup(self.stage, &timestamp, &sha256);

        let created = self
            .store
            .put_new(&path, current.clone())
            .await
            .map_err(|e| PipelineError::Backup(format!("cannot write {}: {}", path, e)))?;
        if !created {
            tracing::debug!("Backup {} already exists, verifying", path);
        }

        let readback = self
            .store
            .get(&path)
            .await
            .map_err(|e| PipelineError::Backup(format!("cannot read back {}: {}", path, e)))?
            .ok_or_else(|| PipelineError::Backup(format!("{} vanished after write", path)))?;
        if sha256_hex(&readback) != sha256 {
            return Err(PipelineError::Backup(format!(
                "{} does not match the registry it backs up",
                path
            )));
        }

        tracing::info!("Backed up {} to {}", self.key(), path);
        Ok(Some(BackupRecord {
            path,
            sha256,
            size: current.len(),
        }))
    }

    /// Replace the committed registry. Callers back up first.
    pub async fn write(&self, registry: &Registry) -> PipelineResult<()> {
        self.store.put(&self.key(), registry.to_bytes()?).await
    }

    pub async fn list_backups(&self) -> PipelineResult<Vec<String>> {
        self.store.list(&paths::backups(self.stage)).await
    }
}
