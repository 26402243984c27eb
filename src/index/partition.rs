//! Partition the ordered section list into work chunks.
//!
//! Chunk ranges are positions into the ordered section list (not section
//! numbers), inclusive on both ends. In pairwise mode every chunk except the
//! last extends one section into its successor so that the boundary pair is
//! computable inside a single chunk. Pairwise chunking counts pairs, so a
//! lone trailing section joins the previous chunk instead of forming a
//! chunk with nothing to compute:
//!
//! ```text
//! N = 25, S = 10
//! pairwise: [0,10] [10,20] [20,24]
//! disjoint: [0, 9] [10,19] [20,24]
//!
//! N = 21, S = 10
//! pairwise: [0,10] [10,20]
//! ```

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Whether chunks share a boundary section with their successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// One section of overlap, needed by pairwise stages
    Pairwise,
    /// No overlap
    Disjoint,
}

/// A contiguous sub-range of the section list. Never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable id: position in the partition
    pub id: u32,

    /// First section position (inclusive)
    pub start: usize,

    /// Last section position (inclusive), including any overlap section
    pub end: usize,

    pub mode: PartitionMode,

    /// Whether `end` is the overlap section shared with the next chunk
    pub overlaps_next: bool,
}

impl Chunk {
    /// Number of sections in the chunk, overlap included.
    pub fn num_sections(&self) -> usize {
        self.end - self.start + 1
    }

    /// Positions this chunk owns, overlap excluded.
    pub fn owned_range(&self) -> RangeInclusive<usize> {
        let owned_end = if self.overlaps_next { self.end - 1 } else { self.end };
        self.start..=owned_end
    }

    /// Positions `i` of the pairs `(i, i+1)` computed by this chunk.
    pub fn pair_positions(&self) -> std::ops::Range<usize> {
        match self.mode {
            PartitionMode::Pairwise => self.start..self.end,
            PartitionMode::Disjoint => self.start..self.start,
        }
    }

    /// How far pair `(i, i+1)` sits from the nearest chunk edge, or `None`
    /// if the chunk does not contain both sections.
    pub fn pair_depth(&self, i: usize) -> Option<usize> {
        if i >= self.start && i < self.end {
            Some((i - self.start).min(self.end - (i + 1)))
        } else {
            None
        }
    }

    /// How far section position `p` sits from the nearest chunk edge, or
    /// `None` if outside the chunk.
    pub fn section_depth(&self, p: usize) -> Option<usize> {
        if p >= self.start && p <= self.end {
            Some((p - self.start).min(self.end - p))
        } else {
            None
        }
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk {} [{},{}]", self.id, self.start, self.end)
    }
}

/// Deterministic partition of `total` sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub total: usize,
    pub chunk_size: usize,
    pub mode: PartitionMode,
    chunks: Vec<Chunk>,
}

impl Partition {
    /// Partition positions `[0, total-1]` into chunks of `chunk_size`
    /// owned sections. The final chunk absorbs the remainder.
    pub fn new(total: usize, chunk_size: usize, mode: PartitionMode) -> PipelineResult<Self> {
        if total == 0 {
            return Err(PipelineError::config("cannot partition an empty section list"));
        }
        if chunk_size < 1 {
            return Err(PipelineError::config("chunk_size must be >= 1"));
        }

        let chunks = match mode {
            PartitionMode::Pairwise => {
                let pairs = total - 1;
                let num_chunks = pairs.div_ceil(chunk_size).max(1);
                (0..num_chunks)
                    .map(|k| {
                        let start = k * chunk_size;
                        let end = (start + chunk_size).min(pairs);
                        Chunk {
                            id: k as u32,
                            start,
                            end,
                            mode,
                            overlaps_next: k + 1 < num_chunks,
                        }
                    })
                    .collect()
            }
            PartitionMode::Disjoint => (0..total.div_ceil(chunk_size))
                .map(|k| {
                    let start = k * chunk_size;
                    Chunk {
                        id: k as u32,
                        start,
                        end: (start + chunk_size - 1).min(total - 1),
                        mode,
                        overlaps_next: false,
                    }
                })
                .collect(),
        };

        Ok(Self {
            total,
            chunk_size,
            mode,
            chunks,
        })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, id: u32) -> Option<&Chunk> {
        self.chunks.get(id as usize)
    }

    /// Number of adjacent pairs the partition must produce.
    pub fn expected_pairs(&self) -> usize {
        match self.mode {
            PartitionMode::Pairwise => self.total - 1,
            PartitionMode::Disjoint => 0,
        }
    }
}
