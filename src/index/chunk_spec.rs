//! Self-contained per-chunk work descriptions.
//!
//! A [`ChunkSpec`] carries everything a worker needs to process one chunk:
//! the chunk range, the sections it covers, and the algorithm parameters.
//! It is written as YAML so an external worker process can pick it up.

use super::partition::{Chunk, Partition};
use super::sections::{Section, Tile, TileKey};
use crate::config::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::io::sha256_hex;
use serde::{Deserialize, Serialize};

/// Identity of an adjacent section pair, by section number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub from: u32,
    pub to: u32,
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.from, self.to)
    }
}

/// Identity of one unit of work in either stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKey {
    Pair(PairKey),
    Tile(TileKey),
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKey::Pair(k) => k.fmt(f),
            UnitKey::Tile(k) => k.fmt(f),
        }
    }
}

/// Work description for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub chunk: Chunk,
    pub stage: Stage,

    /// Sections at positions `chunk.start..=chunk.end`
    pub sections: Vec<Section>,

    /// Algorithm parameters, passed through untouched
    pub params: serde_json::Value,

    /// SHA-256 over the fields above
    pub fingerprint: String,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    chunk: &'a Chunk,
    stage: Stage,
    sections: &'a [Section],
    params: &'a serde_json::Value,
}

impl ChunkSpec {
    pub fn new(
        chunk: Chunk,
        stage: Stage,
        sections: Vec<Section>,
        params: serde_json::Value,
    ) -> PipelineResult<Self> {
        if sections.len() != chunk.num_sections() {
            return Err(PipelineError::config(format!(
                "{} has {} sections, expected {}",
                chunk,
                sections.len(),
                chunk.num_sections()
            )));
        }
        let mut spec = Self {
            chunk,
            stage,
            sections,
            params,
            fingerprint: String::new(),
        };
        spec.fingerprint = spec.compute_fingerprint()?;
        Ok(spec)
    }

    pub fn compute_fingerprint(&self) -> PipelineResult<String> {
        let input = FingerprintInput {
            chunk: &self.chunk,
            stage: self.stage,
            sections: &self.sections,
            params: &self.params,
        };
        Ok(sha256_hex(&serde_json::to_vec(&input)?))
    }

    /// Reject specs edited after they were written.
    pub fn verify(&self) -> PipelineResult<()> {
        if self.compute_fingerprint()? != self.fingerprint {
            return Err(PipelineError::config(format!(
                "fingerprint mismatch for {}",
                self.chunk
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.chunk.id
    }

    /// Section at absolute position `p`.
    pub fn section_at(&self, p: usize) -> Option<&Section> {
        p.checked_sub(self.chunk.start)
            .and_then(|i| self.sections.get(i))
    }

    /// Pairs this chunk computes, with their absolute position.
    pub fn pair_units(&self) -> Vec<(usize, PairKey, &Section, &Section)> {
        self.chunk
            .pair_positions()
            .filter_map(|i| {
                let a = self.section_at(i)?;
                let b = self.section_at(i + 1)?;
                Some((
                    i,
                    PairKey {
                        from: a.num,
                        to: b.num,
                    },
                    a,
                    b,
                ))
            })
            .collect()
    }

    /// Tiles of the sections this chunk owns, in key order.
    pub fn tile_units(&self) -> Vec<(TileKey, &Section, &Tile)> {
        let mut units: Vec<_> = self
            .chunk
            .owned_range()
            .filter_map(|p| self.section_at(p))
            .flat_map(|s| {
                s.layout
                    .iter()
                    .flat_map(|l| l.tiles.iter())
                    .map(move |t| {
                        (
                            TileKey {
                                section: s.num,
                                row: t.row,
                                col: t.col,
                            },
                            s,
                            t,
                        )
                    })
            })
            .collect();
        units.sort_by_key(|(k, _, _)| *k);
        units
    }

    pub fn to_yaml(&self) -> PipelineResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> PipelineResult<Self> {
        let spec: ChunkSpec = serde_yaml::from_str(yaml)?;
        spec.verify()?;
        Ok(spec)
    }
}

/// Splits the section list into chunk specs.
pub struct ConfigPartitioner;

impl ConfigPartitioner {
    /// Deterministic: the same sections, stage, chunk size and params always
    /// yield the same specs and fingerprints.
    pub fn partition(
        sections: &[Section],
        stage: Stage,
        chunk_size: usize,
        params: &serde_json::Value,
    ) -> PipelineResult<Vec<ChunkSpec>> {
        let partition = Partition::new(sections.len(), chunk_size, stage.partition_mode())?;

        let specs = partition
            .chunks()
            .iter()
            .map(|chunk| {
                let slice = sections[chunk.start..=chunk.end].to_vec();
                ChunkSpec::new(*chunk, stage, slice, params.clone())
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        tracing::info!(
            "Partitioned {} sections into {} chunks (stage={}, chunk_size={})",
            sections.len(),
            specs.len(),
            stage,
            chunk_size
        );
        Ok(specs)
    }

    /// Every key the registry of `stage` must contain for `sections`.
    pub fn expected_keys(sections: &[Section], stage: Stage) -> Vec<UnitKey> {
        match stage {
            Stage::CoarseOffsets => sections
                .windows(2)
                .map(|w| {
                    UnitKey::Pair(PairKey {
                        from: w[0].num,
                        to: w[1].num,
                    })
                })
                .collect(),
            Stage::TileMasks => sections
                .iter()
                .flat_map(|s| s.tile_keys())
                .map(UnitKey::Tile)
                .collect(),
        }
    }
}
