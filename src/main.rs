//! SBEM Prep CLI
//!
//! Chunked tile masking and coarse offset estimation for serial-section EM.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sbem_prep::pipeline::BackupAndAuditor;
use sbem_prep::{
    build_runner, build_runtime, init_rayon, io, prepare_chunks, run_stage, ChunkWorker, Config,
    Metrics,
};

#[derive(Parser)]
#[command(name = "sbem-prep")]
#[command(about = "Chunked distributed preprocessing for serial-section EM alignment", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the maximum number of chunks in flight
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Recompute every chunk, ignoring existing manifests
    #[arg(long, global = true)]
    no_resume: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured stage (default if no command specified)
    Run,

    /// Write chunk specs without running anything
    Partition,

    /// Process a single chunk spec (what the command executor launches)
    Worker {
        /// Path to a chunk spec written by `partition`
        #[arg(long)]
        chunk: PathBuf,
    },

    /// Validate configuration
    Validate,

    /// Audit the committed registry of the configured stage
    Audit,

    /// Back up the committed registry of the configured stage
    Backup,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli.config, cli.max_concurrent, cli.no_resume)?;
            run_command(config)?;
        }

        Some(Commands::Partition) => {
            partition_command(load_config(&cli.config, None, false)?)?;
        }

        Some(Commands::Worker { chunk }) => {
            worker_command(load_config(&cli.config, None, false)?, chunk)?;
        }

        Some(Commands::Validate) => {
            load_config(&cli.config, None, false)?;
            println!("Configuration is valid");
        }

        Some(Commands::Audit) => {
            audit_command(load_config(&cli.config, None, false)?)?;
        }

        Some(Commands::Backup) => {
            backup_command(load_config(&cli.config, None, false)?)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            std::fs::write(&output, SAMPLE_CONFIG)?;
            println!("Generated sample configuration at: {}", output.display());
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf, max_concurrent: Option<usize>, no_resume: bool) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("cannot load config {}", path.display()))?;

    // Apply overrides
    if let Some(c) = max_concurrent {
        config.processing.max_concurrent = c;
    }
    if no_resume {
        config.processing.resume = false;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config: Config) -> Result<()> {
    init_rayon(config.processing.rayon_threads)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(run_stage(config))?;

    println!("{}", report);
    if !report.is_success() {
        anyhow::bail!(
            "{} chunk(s) failed permanently: {:?}",
            report.scheduler.failed.len(),
            report.scheduler.failed_ids()
        );
    }
    Ok(())
}

fn partition_command(config: Config) -> Result<()> {
    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let store = io::open_artifact_store(&config)?;
        let (sections, specs) = prepare_chunks(&config, store.as_ref()).await?;

        println!("\n=== Partition ===");
        println!("Stage: {}", config.stage.kind);
        println!("Sections: {}", sections.len());
        println!("Chunks: {}", specs.len());
        for spec in &specs {
            println!("  {} ({} sections)", spec.chunk, spec.chunk.num_sections());
        }
        println!("=================\n");
        Ok(())
    })
}

fn worker_command(config: Config, chunk: PathBuf) -> Result<()> {
    init_rayon(config.processing.rayon_threads)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        let store = io::open_artifact_store(&config)?;
        let worker = ChunkWorker::new(store, build_runner(&config), Metrics::new());
        let outcome = worker
            .run_file(&chunk)
            .await
            .with_context(|| format!("chunk {} failed", chunk.display()))?;
        tracing::info!("{}: {:?}", chunk.display(), outcome);
        Ok(())
    })
}

fn audit_command(config: Config) -> Result<()> {
    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let store = io::open_artifact_store(&config)?;
        let auditor = BackupAndAuditor::new(store, config.stage.kind, config.audit.clone());
        match auditor.audit_committed().await? {
            Some(report) => println!("{}", report),
            None => println!("No registry committed for {}", config.stage.kind),
        }
        Ok(())
    })
}

fn backup_command(config: Config) -> Result<()> {
    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let store = io::open_artifact_store(&config)?;
        let auditor = BackupAndAuditor::new(store, config.stage.kind, config.audit.clone());
        match auditor.backup().await? {
            Some(record) => println!("Backed up {} bytes to {}", record.size, record.path),
            None => println!("No registry committed for {}", config.stage.kind),
        }
        Ok(())
    })
}

const SAMPLE_CONFIG: &str = r#"# SBEM Prep Configuration

# === INPUT: Which sections to process ===
input:
  # Directory with one s{num}_g{grid} directory per section.
  # Each may hold a section.yaml tile layout (required for tile_masks).
  section_dir: "/data/stack/sections"

  # Inclusive section range
  start_section: 0
  end_section: 2499

  # Tolerate gaps in the section numbering (pairs then join the
  # neighbouring sections that do exist)
  allow_missing: false

# === STAGE: What to compute ===
stage:
  # coarse_offsets (pairs of adjacent sections) or tile_masks (per tile)
  kind: coarse_offsets

  # Sections per chunk; pairwise chunks carry one extra overlap section
  chunk_size: 10

# === OUTPUT: Where chunk specs, manifests and the registry live ===
# Choose ONE of: local_path (local disk) OR bucket+prefix (S3)
output:
  local_path: "/data/stack/prep"

  # bucket: "em-bucket"
  # prefix: "stack/prep"

# === PROCESSING: Scheduling ===
processing:
  # Chunks in flight at once
  max_concurrent: 8

  # How often job state is polled (ms)
  submit_interval_ms: 1000

  # Minimum gap between two submissions (ms), protects the cluster scheduler
  min_spacing_ms: 500

  # Reuse chunks whose manifest is already valid
  resume: true

  # rayon_threads: 16
  enable_metrics: true
  metrics_interval_secs: 30

  retry:
    retry_limit: 2
    initial_backoff_ms: 1000
    max_backoff_ms: 60000

# === EXECUTOR: Where chunks run ===
executor:
  kind: local

  # One cluster job per chunk instead:
  # kind: command
  # program: "srun"
  # args: ["-n", "1", "sbem-prep", "-c", "config.yaml", "worker", "--chunk", "{chunk}"]

# === ALGORITHM: Per-unit primitive ===
algorithm:
  # JSON request on stdin, JSON outcome on stdout
  kind: command
  program: "sbem-align-unit"
  args: []
  # Kill and mark unresolved a unit running longer than this
  timeout_secs: 600

  # For tile_masks without resin:
  # kind: smear_only

# === Algorithm parameters (passed through unchanged) ===
mask:
  smear_extend: 20
  threshold: 20
  filter_size: 10
  range_limit: 20

offsets:
  apply_clahe: false
  overlaps_xy: [[200, 300], [200, 300]]
  min_range: [[10, 100, 0], [10, 100, 0]]
  min_overlap: 20
  filter_size: 10
  max_valid_offset: 400

# === AUDIT: Outlier flagging for review ===
audit:
  min_confidence: 0.5
  window_before: 9
  window_after: 9
  sigma_threshold: 5.0
  # max_deviation: 50.0
"#;
