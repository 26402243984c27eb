//! Error taxonomy for the chunked preprocessing pipeline.

use thiserror::Error;

/// Errors surfaced by the pipeline library.
///
/// Per-unit compute failures are normally recorded as
/// [`UnitOutcome::Unresolved`](crate::algorithm::UnitOutcome) inside a chunk
/// manifest and never reach this type; `UnitCompute` is only used when a
/// unit cannot even be described to the algorithm (e.g. a tile the section
/// does not contain).
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid partition or run parameters. Nothing has been started.
    #[error("configuration error: {0}")]
    Config(String),

    /// The executor rejected a chunk submission.
    #[error("chunk {chunk_id} submission failed: {reason}")]
    ChunkSubmission { chunk_id: u32, reason: String },

    /// A single pair or tile could not be prepared for computation.
    #[error("unit {unit} failed: {reason}")]
    UnitCompute { unit: String, reason: String },

    /// The registry would have gaps or unresolvable duplicates.
    #[error(
        "incomplete aggregation: {} missing key(s) [{}], {} conflicting key(s) [{}], failed chunks [{}]",
        missing.len(),
        missing.join(", "),
        conflicting.len(),
        conflicting.join(", "),
        failed_chunks.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
    )]
    IncompleteAggregation {
        missing: Vec<String>,
        conflicting: Vec<String>,
        failed_chunks: Vec<u32>,
    },

    /// The prior registry could not be backed up; nothing was overwritten.
    #[error("backup failed: {0}")]
    Backup(String),

    /// A chunk manifest is missing, malformed, or does not match its chunk.
    #[error("invalid manifest for chunk {chunk_id}: {reason}")]
    Manifest { chunk_id: u32, reason: String },

    /// The executor failed while reporting job state.
    #[error("executor error: {0}")]
    Executor(String),

    /// Underlying artifact store failure.
    #[error("store error at {path}: {reason}")]
    Store { path: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Config(msg.into())
    }

    pub fn store(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Store {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub fn manifest(chunk_id: u32, reason: impl Into<String>) -> Self {
        PipelineError::Manifest {
            chunk_id,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(e: serde_yaml::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_aggregation_names_missing_keys() {
        let err = PipelineError::IncompleteAggregation {
            missing: vec!["(4,5)".to_string()],
            conflicting: vec![],
            failed_chunks: vec![1],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 missing key(s) [(4,5)]"));
        assert!(msg.contains("failed chunks [1]"));
    }

    #[test]
    fn test_config_helper() {
        let err = PipelineError::config("chunk_size must be >= 1");
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("chunk_size"));
    }
}
