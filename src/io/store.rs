//! Object store configuration for S3 and local filesystem output.
//!
//! Artifacts are small JSON/YAML documents, but a cluster run may have many
//! workers writing at once, so the S3 client keeps a sizeable pool and retries
//! throttled requests.

use super::artifact_store::{ArtifactStore, ObjectArtifactStore};
use crate::config::Config;
use anyhow::Result;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(30))
        .with_pool_idle_timeout(Duration::from_secs(90))
        // one connection per concurrently writing worker is plenty
        .with_pool_max_idle_per_host(64)
}

/// Retry configuration for transient failures (429 and 5xx).
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
fn create_authenticated_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config())
        .with_virtual_hosted_style_request(true);

    Ok(Arc::new(builder.build()?))
}

/// Create the output store.
/// Uses LocalFileSystem if local_path is set, otherwise S3 with credentials.
pub fn create_output_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match (&config.output.local_path, &config.output.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (_, Some(bucket)) => create_authenticated_store(bucket),
        _ => anyhow::bail!("Invalid config: no output destination"),
    }
}

/// Key prefix inside the output store.
/// Empty for local output since the path is baked into the store.
pub fn get_output_prefix(config: &Config) -> &str {
    if config.output.is_local() {
        ""
    } else {
        config.output.prefix().unwrap_or("")
    }
}

/// Open the artifact store described by `config.output`.
pub fn open_artifact_store(config: &Config) -> Result<Arc<dyn ArtifactStore>> {
    let store = create_output_store(config)?;
    Ok(Arc::new(ObjectArtifactStore::new(
        store,
        get_output_prefix(config),
    )))
}
