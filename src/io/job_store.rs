//! Append-only job records.
//!
//! Every state transition the scheduler observes is written as its own
//! object, so a crashed run leaves a readable history behind. The latest
//! SUCCEEDED record of each chunk is also kept under a fixed per-chunk key,
//! so resuming reads one object per chunk instead of the whole history.

use super::artifact_store::{paths, ArtifactStore};
use crate::config::Stage;
use crate::error::PipelineResult;
use crate::executor::JobState;
use crate::index::ChunkSpec;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One observed state of a chunk job. Keyed by (run_id, chunk_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: String,
    pub stage: Stage,
    pub chunk_id: u32,

    /// Position in the chunk's record sequence for this run
    pub seq: u32,

    /// Submission attempt, starting at 1
    pub attempt: u32,

    pub state: JobState,

    /// Executor-assigned job id, once submitted
    #[serde(default)]
    pub job_id: Option<String>,

    pub spec_fingerprint: String,

    /// Content hash of the manifest, on success
    #[serde(default)]
    pub manifest_hash: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    /// Completed by an earlier run and skipped here
    #[serde(default)]
    pub resumed: bool,

    pub recorded_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_manifest_hash(mut self, hash: impl Into<String>) -> Self {
        self.manifest_hash = Some(hash.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn resumed(mut self) -> Self {
        self.resumed = true;
        self
    }
}

/// Writes the job records of one run.
pub struct JobStore {
    store: Arc<dyn ArtifactStore>,
    run_id: String,
    stage: Stage,
    next_seq: HashMap<u32, u32>,
}

impl JobStore {
    pub fn new(store: Arc<dyn ArtifactStore>, run_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            stage,
            next_seq: HashMap::new(),
        }
    }

    /// Fresh run id for `stage`, unique per millisecond.
    pub fn new_run_id(stage: Stage) -> String {
        format!("{}-{}", stage, Utc::now().format("%Y%m%dT%H%M%S%3fZ"))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Start a record for `spec`; finish it with the `with_*` builders.
    pub fn record(&self, spec: &ChunkSpec, attempt: u32, state: JobState) -> JobRecord {
        JobRecord {
            run_id: self.run_id.clone(),
            stage: self.stage,
            chunk_id: spec.id(),
            seq: 0,
            attempt,
            state,
            job_id: None,
            spec_fingerprint: spec.fingerprint.clone(),
            manifest_hash: None,
            message: None,
            resumed: false,
            recorded_at: Utc::now(),
        }
    }

    /// Persist a record under the next sequence number of its chunk.
    pub async fn append(&mut self, mut record: JobRecord) -> PipelineResult<JobRecord> {
        let seq = self.next_seq.entry(record.chunk_id).or_insert(0);
        record.seq = *seq;
        *seq += 1;

        let key = paths::job_record(&self.run_id, record.chunk_id, record.seq);
        let bytes = Bytes::from(serde_json::to_vec_pretty(&record)?);
        if !self.store.put_new(&key, bytes.clone()).await? {
            tracing::warn!("Job record {} already exists, overwriting", key);
            self.store.put(&key, bytes.clone()).await?;
        }
        if record.state == JobState::Succeeded {
            self.store
                .put(&paths::latest_succeeded(record.stage, record.chunk_id), bytes)
                .await?;
        }
        tracing::debug!(
            "chunk {} attempt {} -> {:?}",
            record.chunk_id,
            record.attempt,
            record.state
        );
        Ok(record)
    }

    /// All records of every run, in store order.
    pub async fn load_all(store: &dyn ArtifactStore) -> PipelineResult<Vec<JobRecord>> {
        let mut records = Vec::new();
        for key in store.list(paths::jobs_root()).await? {
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<JobRecord>(&bytes) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!("Skipping unreadable job record {}: {}", key, e),
            }
        }
        Ok(records)
    }

    /// Latest SUCCEEDED record of each chunk in `specs`, across runs.
    ///
    /// Records computed under a different chunk spec are ignored.
    pub async fn load_succeeded(
        store: &dyn ArtifactStore,
        specs: &[ChunkSpec],
    ) -> PipelineResult<BTreeMap<u32, JobRecord>> {
        let lookups = specs.iter().map(|spec| Self::load_latest(store, spec));
        Ok(try_join_all(lookups)
            .await?
            .into_iter()
            .flatten()
            .map(|r| (r.chunk_id, r))
            .collect())
    }

    async fn load_latest(
        store: &dyn ArtifactStore,
        spec: &ChunkSpec,
    ) -> PipelineResult<Option<JobRecord>> {
        let key = paths::latest_succeeded(spec.stage, spec.id());
        let Some(bytes) = store.get(&key).await? else {
            return Ok(None);
        };
        let record = match serde_json::from_slice::<JobRecord>(&bytes) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping unreadable job record {}: {}", key, e);
                return Ok(None);
            }
        };
        if record.stage != spec.stage || record.spec_fingerprint != spec.fingerprint {
            tracing::debug!("{}: last success was under another chunk spec", spec.chunk);
            return Ok(None);
        }
        Ok(Some(record))
    }
}
