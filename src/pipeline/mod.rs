//! Pipeline orchestration: chunk workers, scheduling, aggregation and audit.

mod aggregator;
mod audit;
mod metrics;
mod scheduler;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod e2e_tests;

pub use aggregator::{Aggregation, ResultAggregator};
pub use audit::{
    BackupAndAuditor, CommitOutcome, Outlier, OutlierReason, OutlierReport, UnresolvedUnit,
};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use scheduler::{ChunkScheduler, FailedChunk, SchedulerConfig, SchedulerReport};
pub use worker::{ChunkWorker, WorkerOutcome};
