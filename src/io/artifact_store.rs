//! Storage seam for all pipeline artifacts.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutMode, PutPayload};
use std::sync::Arc;

/// Key-value artifact storage. Keys are `/`-separated relative paths.
///
/// `put` must replace the object atomically: a reader sees either the old
/// or the new content, never a mix.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read an object, `None` if absent.
    async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>>;

    /// Write or replace an object.
    async fn put(&self, key: &str, data: Bytes) -> PipelineResult<()>;

    /// Write an object only if absent. Returns `false` if it already exists.
    async fn put_new(&self, key: &str, data: Bytes) -> PipelineResult<bool>;

    /// Remove an object. Removing an absent object is not an error.
    async fn delete(&self, key: &str) -> PipelineResult<()>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> PipelineResult<Vec<String>>;
}

/// [`ArtifactStore`] over any `object_store` backend.
pub struct ObjectArtifactStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// In-memory store, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), "")
    }

    fn location(&self, key: &str) -> Path {
        if self.prefix.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn relative(&self, location: &Path) -> String {
        let full = location.to_string();
        if self.prefix.is_empty() {
            full
        } else {
            full.strip_prefix(&self.prefix)
                .map(|s| s.trim_start_matches('/').to_string())
                .unwrap_or(full)
        }
    }
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>> {
        let location = self.location(key);
        match self.store.get(&location).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| PipelineError::store(key, e))?;
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(PipelineError::store(key, e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> PipelineResult<()> {
        self.store
            .put(&self.location(key), PutPayload::from(data))
            .await
            .map_err(|e| PipelineError::store(key, e))?;
        Ok(())
    }

    async fn put_new(&self, key: &str, data: Bytes) -> PipelineResult<bool> {
        let result = self
            .store
            .put_opts(&self.location(key), PutPayload::from(data), PutMode::Create.into())
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(PipelineError::store(key, e)),
        }
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        match self.store.delete(&self.location(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(PipelineError::store(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        let location = self.location(prefix.trim_end_matches('/'));
        let listed: Vec<_> = self.store.list(Some(&location)).collect::<Vec<_>>().await;

        let mut keys = Vec::with_capacity(listed.len());
        for meta in listed {
            let meta = meta.map_err(|e| PipelineError::store(prefix, e))?;
            keys.push(self.relative(&meta.location));
        }
        keys.sort();
        Ok(keys)
    }
}

/// Artifact key layout.
pub mod paths {
    use crate::config::Stage;

    pub fn chunk_spec(stage: Stage, chunk_id: u32) -> String {
        format!("chunks/{}/chunk_{:05}.yaml", stage, chunk_id)
    }

    pub fn manifest(stage: Stage, chunk_id: u32) -> String {
        format!("manifests/{}/chunk_{:05}.json", stage, chunk_id)
    }

    pub fn jobs_root() -> &'static str {
        "jobs"
    }

    pub fn job_record(run_id: &str, chunk_id: u32, seq: u32) -> String {
        format!("jobs/{}/chunk_{:05}/{:06}.json", run_id, chunk_id, seq)
    }

    pub fn latest_succeeded(stage: Stage, chunk_id: u32) -> String {
        format!("succeeded/{}/chunk_{:05}.json", stage, chunk_id)
    }

    pub fn registry(stage: Stage) -> String {
        format!("registry/{}.json", stage)
    }

    pub fn backups(stage: Stage) -> String {
        format!("backups/{}", stage)
    }

    pub fn backup(stage: Stage, timestamp: &str, hash: &str) -> String {
        let short = &hash[..hash.len().min(16)];
        format!("backups/{}/{}_{}.json", stage, timestamp, short)
    }

    pub fn audit_json(stage: Stage) -> String {
        format!("audit/{}_outliers.json", stage)
    }

    pub fn audit_tsv(stage: Stage) -> String {
        format!("audit/{}_outliers.tsv", stage)
    }
}
