//! Section discovery, partitioning and chunk specs.

mod chunk_spec;
mod partition;
mod sections;

pub use chunk_spec::{ChunkSpec, ConfigPartitioner, PairKey, UnitKey};
pub use partition::{Chunk, Partition, PartitionMode};
pub use sections::{
    missing_sections, parse_section_dir_name, Section, SectionList, SectionListLoader, Tile,
    TileKey, TileLayout, SECTION_LAYOUT_FILE,
};
