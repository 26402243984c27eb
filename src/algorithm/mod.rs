//! Boundary to the external registration and masking primitives.
//!
//! Both primitives are pure, stateless, single-unit operations. A unit that
//! cannot be computed comes back as [`UnitOutcome::Unresolved`] and is carried
//! through manifests and the registry for human triage.

mod command;
mod mask;
mod smear;

pub use command::CommandAlgorithm;
pub use mask::{BinaryMask, EncodedMasks};
pub use smear::SmearOnlyMasker;

use crate::index::{Section, Tile, TileLayout};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome<T> {
    Resolved(T),
    Unresolved { reason: String },
}

impl<T> UnitOutcome<T> {
    pub fn unresolved(reason: impl Into<String>) -> Self {
        UnitOutcome::Unresolved {
            reason: reason.into(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, UnitOutcome::Resolved(_))
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            UnitOutcome::Resolved(v) => Some(v),
            UnitOutcome::Unresolved { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> UnitOutcome<U> {
        match self {
            UnitOutcome::Resolved(v) => UnitOutcome::Resolved(f(v)),
            UnitOutcome::Unresolved { reason } => UnitOutcome::Unresolved { reason },
        }
    }
}

/// Estimated rigid offset between two sections, `[z]yx` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec<f64>,
}

impl Transform {
    pub fn new(translation: Vec<f64>) -> Self {
        Self { translation }
    }

    pub fn magnitude(&self) -> f64 {
        self.translation.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
    }
}

/// Coarse offset estimate for one section pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairEstimate {
    pub transform: Transform,
    pub confidence: f64,
}

/// Masks for one tile at the algorithm boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMasks {
    pub smear: Array2<bool>,
    pub resin: Array2<bool>,
}

/// Computes the coarse offset between two adjacent sections.
pub trait PairAligner: Send + Sync {
    fn compute_pair(
        &self,
        a: &Section,
        b: &Section,
        params: &serde_json::Value,
    ) -> UnitOutcome<PairEstimate>;
}

/// Computes smear and resin masks for a single tile.
pub trait TileMasker: Send + Sync {
    fn compute_mask(
        &self,
        section: &Section,
        layout: &TileLayout,
        tile: &Tile,
        params: &serde_json::Value,
    ) -> UnitOutcome<TileMasks>;
}

/// The primitive a chunk worker drives, selected by stage.
#[derive(Clone)]
pub enum UnitRunner {
    Pairs(Arc<dyn PairAligner>),
    Masks(Arc<dyn TileMasker>),
}
