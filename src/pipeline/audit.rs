//! Registry commit with backup, and the post-aggregation outlier audit.

use crate::algorithm::{PairEstimate, UnitOutcome};
use crate::config::{AuditConfig, Stage};
use crate::error::PipelineResult;
use crate::io::{paths, ArtifactStore, BackupRecord, Registry, RegistryStore, UnitResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;

/// Result of committing a registry.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Identical content was already committed
    Unchanged,
    /// Registry written; `backup` is the snapshot of what it replaced
    Committed { backup: Option<BackupRecord> },
}

/// Why an entry was flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutlierReason {
    LowConfidence { confidence: f64, min: f64 },
    NonFinite { component: usize },
    Deviation { component: usize, value: f64, mean: f64, stddev: f64 },
    AbsoluteDeviation { component: usize, value: f64, mean: f64, limit: f64 },
}

impl std::fmt::Display for OutlierReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutlierReason::LowConfidence { confidence, min } => {
                write!(f, "confidence {:.3} < {:.3}", confidence, min)
            }
            OutlierReason::NonFinite { component } => write!(f, "component {} not finite", component),
            OutlierReason::Deviation {
                component,
                value,
                mean,
                stddev,
            } => write!(
                f,
                "component {} = {:.3}, window mean {:.3} +/- {:.3}",
                component, value, mean, stddev
            ),
            OutlierReason::AbsoluteDeviation {
                component,
                value,
                mean,
                limit,
            } => write!(
                f,
                "component {} = {:.3}, more than {:.3} from window mean {:.3}",
                component, value, limit, mean
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlier {
    pub key: String,
    pub translation: Vec<f64>,
    pub confidence: f64,
    pub reasons: Vec<OutlierReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedUnit {
    pub key: String,
    pub reason: String,
}

/// Entries a human should look at before the next stage consumes the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierReport {
    pub stage: Stage,
    pub registry_hash: String,
    pub total_entries: usize,
    pub flagged: Vec<Outlier>,
    pub unresolved: Vec<UnresolvedUnit>,
}

impl OutlierReport {
    pub fn is_clean(&self) -> bool {
        self.flagged.is_empty() && self.unresolved.is_empty()
    }

    /// One row per flagged or unresolved key.
    pub fn to_tsv(&self) -> String {
        let mut out = String::from("key\tstatus\ttranslation\tconfidence\tdetail\n");
        for o in &self.flagged {
            let translation: Vec<String> = o.translation.iter().map(|v| format!("{:.4}", v)).collect();
            let detail: Vec<String> = o.reasons.iter().map(|r| r.to_string()).collect();
            let _ = writeln!(
                out,
                "{}\tflagged\t{}\t{:.4}\t{}",
                o.key,
                translation.join(","),
                o.confidence,
                detail.join("; ")
            );
        }
        for u in &self.unresolved {
            let _ = writeln!(out, "{}\tunresolved\t\t\t{}", u.key, u.reason);
        }
        out
    }
}

impl std::fmt::Display for OutlierReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} entries, {} flagged, {} unresolved",
            self.stage,
            self.total_entries,
            self.flagged.len(),
            self.unresolved.len()
        )
    }
}

/// Commits registries behind a verified backup and audits them.
pub struct BackupAndAuditor {
    store: Arc<dyn ArtifactStore>,
    registry: RegistryStore,
    config: AuditConfig,
}

impl BackupAndAuditor {
    pub fn new(store: Arc<dyn ArtifactStore>, stage: Stage, config: AuditConfig) -> Self {
        Self {
            registry: RegistryStore::new(store.clone(), stage),
            store,
            config,
        }
    }

    pub fn registry_store(&self) -> &RegistryStore {
        &self.registry
    }

    /// Replace the committed registry with `registry`.
    ///
    /// The current registry is backed up first. If the backup cannot be
    /// written and verified, nothing is replaced.
    pub async fn commit(&self, registry: &Registry) -> PipelineResult<CommitOutcome> {
        let bytes = registry.to_bytes()?;
        if self.registry.load_raw().await?.as_ref() == Some(&bytes) {
            tracing::info!("Registry {} unchanged, not committing", self.registry.key());
            return Ok(CommitOutcome::Unchanged);
        }

        let backup = self.registry.backup().await?;
        self.registry.write(registry).await?;
        tracing::info!(
            "Committed {} ({} entries, hash {})",
            self.registry.key(),
            registry.len(),
            registry.content_hash
        );
        Ok(CommitOutcome::Committed { backup })
    }

    /// Back up the committed registry on demand.
    pub async fn backup(&self) -> PipelineResult<Option<BackupRecord>> {
        self.registry.backup().await
    }

    /// Flag suspicious entries of `registry`.
    pub fn audit(&self, registry: &Registry) -> OutlierReport {
        let resolved: Vec<(String, &PairEstimate)> = registry
            .entries
            .iter()
            .filter_map(|e| match e {
                UnitResult::Pair {
                    key,
                    outcome: UnitOutcome::Resolved(est),
                } => Some((key.to_string(), est)),
                _ => None,
            })
            .collect();

        let flagged = resolved
            .iter()
            .enumerate()
            .filter_map(|(i, (key, est))| {
                let reasons = self.check(i, &resolved);
                (!reasons.is_empty()).then(|| Outlier {
                    key: key.clone(),
                    translation: est.transform.translation.clone(),
                    confidence: est.confidence,
                    reasons,
                })
            })
            .collect();

        let unresolved = registry
            .unresolved()
            .into_iter()
            .map(|(key, reason)| UnresolvedUnit {
                key: key.to_string(),
                reason: reason.to_string(),
            })
            .collect();

        OutlierReport {
            stage: registry.stage,
            registry_hash: registry.content_hash.clone(),
            total_entries: registry.len(),
            flagged,
            unresolved,
        }
    }

    fn check(&self, i: usize, resolved: &[(String, &PairEstimate)]) -> Vec<OutlierReason> {
        let cfg = &self.config;
        let est = resolved[i].1;
        let mut reasons = Vec::new();

        if est.confidence.is_nan() || est.confidence < cfg.min_confidence {
            reasons.push(OutlierReason::LowConfidence {
                confidence: est.confidence,
                min: cfg.min_confidence,
            });
        }

        let lo = i.saturating_sub(cfg.window_before);
        let hi = (i + 1 + cfg.window_after).min(resolved.len());
        let window: Vec<&[f64]> = (lo..hi)
            .filter(|&j| j != i)
            .map(|j| resolved[j].1.transform.translation.as_slice())
            .filter(|t| t.len() == est.transform.translation.len() && t.iter().all(|v| v.is_finite()))
            .collect();

        for (c, &value) in est.transform.translation.iter().enumerate() {
            if !value.is_finite() {
                reasons.push(OutlierReason::NonFinite { component: c });
                continue;
            }
            if window.len() < 2 {
                continue;
            }
            let n = window.len() as f64;
            let mean = window.iter().map(|t| t[c]).sum::<f64>() / n;
            let var = window.iter().map(|t| (t[c] - mean).powi(2)).sum::<f64>() / n;
            let stddev = var.sqrt();
            let dist = (value - mean).abs();

            if dist > cfg.sigma_threshold * stddev {
                reasons.push(OutlierReason::Deviation {
                    component: c,
                    value,
                    mean,
                    stddev,
                });
            } else if let Some(limit) = cfg.max_deviation.filter(|&l| dist > l) {
                reasons.push(OutlierReason::AbsoluteDeviation {
                    component: c,
                    value,
                    mean,
                    limit,
                });
            }
        }
        reasons
    }

    /// Write `report` as JSON and TSV. Returns both keys.
    pub async fn write_report(&self, report: &OutlierReport) -> PipelineResult<(String, String)> {
        let json_key = paths::audit_json(report.stage);
        let tsv_key = paths::audit_tsv(report.stage);
        self.store
            .put(&json_key, Bytes::from(serde_json::to_vec_pretty(report)?))
            .await?;
        self.store.put(&tsv_key, Bytes::from(report.to_tsv())).await?;

        if report.is_clean() {
            tracing::info!("Audit {}", report);
        } else {
            tracing::warn!("Audit {} (see {})", report, tsv_key);
        }
        Ok((json_key, tsv_key))
    }

    /// Audit the committed registry, `None` if nothing is committed.
    pub async fn audit_committed(&self) -> PipelineResult<Option<OutlierReport>> {
        let Some(registry) = self.registry.load().await? else {
            return Ok(None);
        };
        let report = self.audit(&registry);
        self.write_report(&report).await?;
        Ok(Some(report))
    }
}
