//! Run-length encoded binary masks for manifests and the registry.

use super::TileMasks;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Binary mask stored as `[start, len]` runs of `true` over the row-major
/// flattened pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryMask {
    pub height: usize,
    pub width: usize,
    pub runs: Vec<[usize; 2]>,
}

impl BinaryMask {
    pub fn empty(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            runs: Vec::new(),
        }
    }

    pub fn from_array(mask: &Array2<bool>) -> Self {
        let (height, width) = mask.dim();
        let mut runs = Vec::new();
        let mut current: Option<[usize; 2]> = None;

        for (i, &v) in mask.iter().enumerate() {
            match (v, current.as_mut()) {
                (true, Some(run)) => run[1] += 1,
                (true, None) => current = Some([i, 1]),
                (false, Some(_)) => runs.extend(current.take()),
                (false, None) => {}
            }
        }
        runs.extend(current);

        Self { height, width, runs }
    }

    pub fn to_array(&self) -> Array2<bool> {
        let mut flat = vec![false; self.height * self.width];
        for &[start, len] in &self.runs {
            let end = (start + len).min(flat.len());
            flat[start.min(end)..end].iter_mut().for_each(|v| *v = true);
        }
        Array2::from_shape_vec((self.height, self.width), flat)
            .unwrap_or_else(|_| Array2::from_elem((self.height, self.width), false))
    }

    /// Number of masked pixels.
    pub fn count(&self) -> usize {
        self.runs.iter().map(|r| r[1]).sum()
    }

    /// Fraction of masked pixels.
    pub fn coverage(&self) -> f64 {
        let total = self.height * self.width;
        if total == 0 {
            0.0
        } else {
            self.count() as f64 / total as f64
        }
    }
}

/// Smear and resin masks of one tile, encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedMasks {
    pub smear: BinaryMask,
    pub resin: BinaryMask,
}

impl From<&TileMasks> for EncodedMasks {
    fn from(masks: &TileMasks) -> Self {
        Self {
            smear: BinaryMask::from_array(&masks.smear),
            resin: BinaryMask::from_array(&masks.resin),
        }
    }
}
