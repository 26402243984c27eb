//! Built-in masker for stacks without resin: masks the scan smear only.

use super::{TileMasker, TileMasks, UnitOutcome};
use crate::index::{Section, Tile, TileLayout};
use ndarray::{s, Array2};

/// Masks the top `smear_extend` rows of every tile.
///
/// The smear band must stay inside the tile overlap (with 20% slack),
/// otherwise stitching would lose image content.
#[derive(Debug, Clone)]
pub struct SmearOnlyMasker {
    smear_extend: usize,
}

impl SmearOnlyMasker {
    pub fn new(smear_extend: usize) -> Self {
        Self { smear_extend }
    }
}

impl TileMasker for SmearOnlyMasker {
    fn compute_mask(
        &self,
        _section: &Section,
        layout: &TileLayout,
        _tile: &Tile,
        _params: &serde_json::Value,
    ) -> UnitOutcome<TileMasks> {
        if self.smear_extend as f64 >= 1.2 * layout.tile_overlap as f64 {
            return UnitOutcome::unresolved(format!(
                "smear_extend {} must be below 1.2 x tile_overlap {}",
                self.smear_extend, layout.tile_overlap
            ));
        }

        let shape = (layout.tile_height, layout.tile_width);
        let mut smear = Array2::from_elem(shape, false);
        let rows = self.smear_extend.min(layout.tile_height);
        smear.slice_mut(s![..rows, ..]).fill(true);

        UnitOutcome::Resolved(TileMasks {
            smear,
            resin: Array2::from_elem(shape, false),
        })
    }
}
