//! Configuration for the chunked preprocessing pipeline.

use crate::error::{PipelineError, PipelineResult};
use crate::index::PartitionMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the sections live and which of them to process
    pub input: InputConfig,

    /// Which stage to run and how to chunk it
    pub stage: StageConfig,

    /// Output store for chunk artifacts, manifests and the registry
    pub output: OutputConfig,

    /// Scheduling, concurrency and retry settings
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Backend that executes chunks
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// External algorithm used by chunk workers
    pub algorithm: AlgorithmConfig,

    /// Tile-mask algorithm parameters (passed through to the algorithm)
    #[serde(default)]
    pub mask: MaskParams,

    /// Coarse-offset algorithm parameters (passed through to the algorithm)
    #[serde(default)]
    pub offsets: OffsetParams,

    /// Outlier audit thresholds
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Input section configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Directory holding one `s{num}_g{grid}` directory per section
    pub section_dir: String,

    /// First section number to process (inclusive)
    #[serde(default)]
    pub start_section: u32,

    /// Last section number to process (inclusive)
    pub end_section: u32,

    /// Tolerate section numbers missing from the range.
    /// Pairs then join consecutive existing sections.
    #[serde(default)]
    pub allow_missing: bool,
}

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Pairwise coarse offsets between adjacent sections
    CoarseOffsets,
    /// Per-tile smear and resin masks
    TileMasks,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CoarseOffsets => "coarse_offsets",
            Stage::TileMasks => "tile_masks",
        }
    }

    /// Pairwise stages need one section of overlap between chunks.
    pub fn partition_mode(&self) -> PartitionMode {
        match self {
            Stage::CoarseOffsets => PartitionMode::Pairwise,
            Stage::TileMasks => PartitionMode::Disjoint,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage selection and chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: Stage,

    /// Target number of sections per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Output store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local filesystem root for all artifacts.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 key prefix (required if local_path is not set)
    #[serde(default)]
    pub prefix: Option<String>,
}

impl OutputConfig {
    /// Check if output is to local filesystem.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Get the output location as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }

    /// Get the S3 prefix if this is an S3 output.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum number of chunks running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Scheduler tick: how often job state is polled and free slots refilled
    #[serde(default = "default_submit_interval_ms")]
    pub submit_interval_ms: u64,

    /// Minimum time between two consecutive submissions
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,

    /// Retry configuration for failed chunks
    #[serde(default)]
    pub retry: RetryConfig,

    /// Skip chunks whose manifest is already valid
    #[serde(default = "default_true")]
    pub resume: bool,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for per-unit work inside a chunk
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl ProcessingConfig {
    pub fn submit_interval(&self) -> Duration {
        Duration::from_millis(self.submit_interval_ms)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            submit_interval_ms: default_submit_interval_ms(),
            min_spacing_ms: default_min_spacing_ms(),
            retry: RetryConfig::default(),
            resume: true,
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Retry configuration for failed chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Resubmissions allowed after the first failed attempt
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Backoff before resubmitting after `failures` failed attempts.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Chunk execution backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// Run chunk workers in-process
    #[default]
    Local,

    /// Launch one external command per chunk (e.g. `srun sbem-prep worker`).
    /// `{chunk}` in `args` is replaced with the chunk spec path.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Algorithm used for each unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// One process per unit, JSON request on stdin, JSON outcome on stdout
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,

        /// A unit still running after this long is killed and left unresolved
        #[serde(default = "default_unit_timeout_secs")]
        timeout_secs: u64,
    },

    /// Mask the top `mask.smear_extend` rows of every tile, no resin mask
    SmearOnly,
}

/// Tile-mask parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskParams {
    #[serde(default = "default_smear_extend")]
    pub smear_extend: usize,
    #[serde(default = "default_mask_threshold")]
    pub threshold: u32,
    #[serde(default = "default_mask_filter_size")]
    pub filter_size: u32,
    #[serde(default = "default_range_limit")]
    pub range_limit: u32,
}

impl Default for MaskParams {
    fn default() -> Self {
        Self {
            smear_extend: default_smear_extend(),
            threshold: default_mask_threshold(),
            filter_size: default_mask_filter_size(),
            range_limit: default_range_limit(),
        }
    }
}

/// Coarse-offset parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetParams {
    #[serde(default)]
    pub apply_clahe: bool,
    #[serde(default = "default_overlaps_xy")]
    pub overlaps_xy: [[u32; 2]; 2],
    #[serde(default = "default_min_range")]
    pub min_range: [[u32; 3]; 2],
    #[serde(default = "default_min_overlap")]
    pub min_overlap: u32,
    #[serde(default = "default_offset_filter_size")]
    pub filter_size: u32,
    #[serde(default = "default_max_valid_offset")]
    pub max_valid_offset: u32,
}

impl Default for OffsetParams {
    fn default() -> Self {
        Self {
            apply_clahe: false,
            overlaps_xy: default_overlaps_xy(),
            min_range: default_min_range(),
            min_overlap: default_min_overlap(),
            filter_size: default_offset_filter_size(),
            max_valid_offset: default_max_valid_offset(),
        }
    }
}

/// Outlier audit thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Pairs with confidence below this are flagged
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Neighbours before a pair included in its reference window
    #[serde(default = "default_window")]
    pub window_before: usize,

    /// Neighbours after a pair included in its reference window
    #[serde(default = "default_window")]
    pub window_after: usize,

    /// Flag components further than this many stddevs from the window mean
    #[serde(default = "default_sigma_threshold")]
    pub sigma_threshold: f64,

    /// Flag components further than this absolute distance from the window mean
    #[serde(default)]
    pub max_deviation: Option<f64>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            window_before: default_window(),
            window_after: default_window(),
            sigma_threshold: default_sigma_threshold(),
            max_deviation: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Algorithm parameters for the configured stage, as passed to workers.
    pub fn algorithm_params(&self) -> PipelineResult<serde_json::Value> {
        let value = match self.stage.kind {
            Stage::CoarseOffsets => serde_json::to_value(&self.offsets)?,
            Stage::TileMasks => serde_json::to_value(&self.mask)?,
        };
        Ok(value)
    }

    /// Validate the configuration. Nothing is executed on failure.
    pub fn validate(&self) -> PipelineResult<()> {
        match (&self.output.local_path, &self.output.bucket, &self.output.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(PipelineError::config(
                    "Cannot specify both local_path and bucket/prefix",
                ));
            }
            (None, None, _) | (None, _, None) => {
                return Err(PipelineError::config(
                    "Must specify either local_path or both bucket and prefix",
                ));
            }
            _ => {}
        }

        if self.input.section_dir.is_empty() {
            return Err(PipelineError::config("input.section_dir must be set"));
        }
        if self.input.start_section > self.input.end_section {
            return Err(PipelineError::config(format!(
                "start_section {} is after end_section {}",
                self.input.start_section, self.input.end_section
            )));
        }
        if self.stage.chunk_size < 1 {
            return Err(PipelineError::config("chunk_size must be >= 1"));
        }
        if self.processing.max_concurrent == 0 {
            return Err(PipelineError::config("max_concurrent must be > 0"));
        }
        if self.processing.submit_interval_ms == 0 {
            return Err(PipelineError::config("submit_interval_ms must be > 0"));
        }
        if self.processing.retry.initial_backoff_ms > self.processing.retry.max_backoff_ms {
            return Err(PipelineError::config(
                "initial_backoff_ms must not exceed max_backoff_ms",
            ));
        }

        if let ExecutorConfig::Command { program, .. } = &self.executor {
            if program.is_empty() {
                return Err(PipelineError::config("executor.program must not be empty"));
            }
        }
        match &self.algorithm {
            AlgorithmConfig::Command { program, .. } if program.is_empty() => {
                return Err(PipelineError::config("algorithm.program must not be empty"));
            }
            AlgorithmConfig::Command { timeout_secs: 0, .. } => {
                return Err(PipelineError::config("algorithm.timeout_secs must be > 0"));
            }
            AlgorithmConfig::SmearOnly if self.stage.kind != Stage::TileMasks => {
                return Err(PipelineError::config(
                    "smear_only algorithm only applies to the tile_masks stage",
                ));
            }
            _ => {}
        }

        if !(self.audit.sigma_threshold > 0.0) {
            return Err(PipelineError::config("audit.sigma_threshold must be > 0"));
        }
        if let Some(max) = self.audit.max_deviation {
            if !(max > 0.0) {
                return Err(PipelineError::config("audit.max_deviation must be > 0"));
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_chunk_size() -> usize { 10 }
fn default_max_concurrent() -> usize { 8 }
fn default_submit_interval_ms() -> u64 { 1000 }
fn default_min_spacing_ms() -> u64 { 500 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 30 }
fn default_retry_limit() -> u32 { 2 }
fn default_initial_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 60_000 }
fn default_smear_extend() -> usize { 20 }
fn default_mask_threshold() -> u32 { 20 }
fn default_mask_filter_size() -> u32 { 10 }
fn default_range_limit() -> u32 { 20 }
fn default_overlaps_xy() -> [[u32; 2]; 2] { [[200, 300], [200, 300]] }
fn default_min_range() -> [[u32; 3]; 2] { [[10, 100, 0], [10, 100, 0]] }
fn default_min_overlap() -> u32 { 20 }
fn default_offset_filter_size() -> u32 { 10 }
fn default_max_valid_offset() -> u32 { 400 }
fn default_min_confidence() -> f64 { 0.5 }
fn default_window() -> usize { 9 }
fn default_sigma_threshold() -> f64 { 5.0 }
fn default_unit_timeout_secs() -> u64 { 600 }
