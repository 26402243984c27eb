//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Job submissions, retries included
    pub chunks_submitted: AtomicU64,

    /// Chunks confirmed complete in this run
    pub chunks_succeeded: AtomicU64,

    /// Chunks skipped because an earlier run completed them
    pub chunks_resumed: AtomicU64,

    /// Chunks that exhausted their retries
    pub chunks_failed: AtomicU64,

    /// Resubmissions after a failed attempt
    pub retries: AtomicU64,

    /// Units computed with a result
    pub units_resolved: AtomicU64,

    /// Units recorded as unresolved
    pub units_unresolved: AtomicU64,

    /// Manifest bytes written
    pub bytes_written: AtomicU64,

    start_time: Option<Instant>,

    /// Time spent in the external algorithm (microseconds, summed across threads)
    pub compute_us: AtomicU64,

    /// Time spent writing manifests (microseconds)
    pub manifest_write_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_chunk_submitted(&self) {
        self.chunks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_succeeded(&self) {
        self.chunks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_resumed(&self) {
        self.chunks_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the unit outcomes of one chunk.
    pub fn add_units(&self, resolved: u64, unresolved: u64) {
        self.units_resolved.fetch_add(resolved, Ordering::Relaxed);
        self.units_unresolved.fetch_add(unresolved, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record time spent computing units (in microseconds).
    pub fn add_compute_time(&self, duration: Duration) {
        self.compute_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent writing a manifest (in microseconds).
    pub fn add_manifest_write_time(&self, duration: Duration) {
        self.manifest_write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Completed chunks (this run) per minute.
    pub fn chunks_per_minute(&self) -> f64 {
        let chunks = self.chunks_succeeded.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            chunks as f64 * 60.0 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_submitted: self.chunks_submitted.load(Ordering::Relaxed),
            chunks_succeeded: self.chunks_succeeded.load(Ordering::Relaxed),
            chunks_resumed: self.chunks_resumed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            units_resolved: self.units_resolved.load(Ordering::Relaxed),
            units_unresolved: self.units_unresolved.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            chunks_per_minute: self.chunks_per_minute(),
            compute_secs: self.compute_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            manifest_write_secs: self.manifest_write_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_submitted: u64,
    pub chunks_succeeded: u64,
    pub chunks_resumed: u64,
    pub chunks_failed: u64,
    pub retries: u64,
    pub units_resolved: u64,
    pub units_unresolved: u64,
    pub bytes_written: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub chunks_per_minute: f64,
    /// Total CPU time in the algorithm (seconds, summed across threads)
    pub compute_secs: f64,
    pub manifest_write_secs: f64,
}

impl MetricsSnapshot {
    /// Chunks in a terminal state.
    pub fn chunks_done(&self) -> u64 {
        self.chunks_succeeded + self.chunks_resumed + self.chunks_failed
    }

    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.units_resolved + self.units_unresolved;
        let resolved_pct = if units > 0 {
            self.units_resolved as f64 / units as f64 * 100.0
        } else {
            0.0
        };

        write!(
            f,
            "Chunks: {} succeeded, {} resumed, {} failed | Submitted: {} ({} retries) | \
             Units: {} ({:.0}% resolved) | Rate: {:.1} chunks/min | Elapsed: {:.1}s",
            self.chunks_succeeded,
            self.chunks_resumed,
            self.chunks_failed,
            self.chunks_submitted,
            self.retries,
            units,
            resolved_pct,
            self.chunks_per_minute,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_chunks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_chunks > 0 {
                        snapshot.chunks_done() as f64 / self.total_chunks as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Run Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Chunks total: {}", self.total_chunks);
        println!("Chunks succeeded: {}", snapshot.chunks_succeeded);
        println!("Chunks resumed: {}", snapshot.chunks_resumed);
        println!("Chunks failed: {}", snapshot.chunks_failed);
        println!("Submissions: {} ({} retries)", snapshot.chunks_submitted, snapshot.retries);
        println!("Units resolved: {}", snapshot.units_resolved);
        println!("Units unresolved: {}", snapshot.units_unresolved);
        println!(
            "Manifests written: {:.2} MB",
            snapshot.bytes_written as f64 / (1024.0 * 1024.0)
        );
        if snapshot.compute_secs > 0.0 {
            println!("Algorithm time: {:.1}s (summed across threads)", snapshot.compute_secs);
        }
        println!("===================\n");
    }
}
