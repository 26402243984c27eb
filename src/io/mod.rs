//! Artifact storage: chunk specs, manifests, job records and the registry.

mod artifact_store;
mod job_store;
mod manifest;
mod registry;
mod store;

pub use artifact_store::{paths, ArtifactStore, ObjectArtifactStore};
pub use job_store::{JobRecord, JobStore};
pub use manifest::{ChunkManifest, ManifestStore, UnitResult};
pub use registry::{BackupRecord, Registry, RegistryStore};
pub use store::{create_output_store, get_output_prefix, open_artifact_store};

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
