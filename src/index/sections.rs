//! Resolve the ordered list of sections (and their tiles) to process.
//!
//! Sections live in `section_dir` as one directory per section named
//! `s{num}_g{grid}`, optionally carrying a `section.yaml` that describes the
//! tile grid.

use crate::config::InputConfig;
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Name of the per-section tile layout file.
pub const SECTION_LAYOUT_FILE: &str = "section.yaml";

/// One ordered 2-D image layer. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Section number along the acquisition (z) axis
    pub num: u32,

    /// Tile grid number
    pub grid: u32,

    /// Section directory
    pub path: String,

    /// Tile grid, when `section.yaml` is present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<TileLayout>,
}

impl Section {
    pub fn new(num: u32, grid: u32, path: impl Into<String>) -> Self {
        Self {
            num,
            grid,
            path: path.into(),
            layout: None,
        }
    }

    pub fn with_layout(mut self, layout: TileLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Directory name in `s{num}_g{grid}` form.
    pub fn name(&self) -> String {
        format!("s{}_g{}", self.num, self.grid)
    }

    /// Keys of all tiles in this section, in row-major order.
    pub fn tile_keys(&self) -> Vec<TileKey> {
        let mut keys: Vec<TileKey> = self
            .layout
            .iter()
            .flat_map(|l| l.tiles.iter())
            .map(|t| TileKey {
                section: self.num,
                row: t.row,
                col: t.col,
            })
            .collect();
        keys.sort();
        keys
    }
}

/// Tile grid of a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileLayout {
    /// Grid shape (rows, cols)
    pub grid_shape: [u32; 2],

    /// Tile height in pixels
    pub tile_height: usize,

    /// Tile width in pixels
    pub tile_width: usize,

    /// Overlap between neighbouring tiles in pixels
    #[serde(default)]
    pub tile_overlap: usize,

    /// Tiles present in the grid (positions may be empty)
    pub tiles: Vec<Tile>,
}

impl TileLayout {
    pub fn tile_at(&self, row: u32, col: u32) -> Option<&Tile> {
        self.tiles.iter().find(|t| t.row == row && t.col == col)
    }

    /// Every tile sits inside `grid_shape`, at a distinct position, with a
    /// distinct id.
    pub fn validate(&self) -> Result<(), String> {
        let [rows, cols] = self.grid_shape;
        let mut positions = HashSet::with_capacity(self.tiles.len());
        let mut ids = HashSet::with_capacity(self.tiles.len());
        for t in &self.tiles {
            if t.row >= rows || t.col >= cols {
                return Err(format!(
                    "tile {} at ({}, {}) is outside the {}x{} grid",
                    t.id, t.row, t.col, rows, cols
                ));
            }
            if !positions.insert((t.row, t.col)) {
                return Err(format!("two tiles at ({}, {})", t.row, t.col));
            }
            if !ids.insert(t.id) {
                return Err(format!("tile id {} appears twice", t.id));
            }
        }
        Ok(())
    }
}

/// One rectangular sub-image of a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    /// Acquisition tile id
    pub id: u32,
    pub row: u32,
    pub col: u32,
    /// Pixel data reference
    pub path: String,
}

/// Tile identity: section number plus grid coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub section: u32,
    pub row: u32,
    pub col: u32,
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}[{},{}]", self.section, self.row, self.col)
    }
}

/// Ordered, validated list of sections.
#[derive(Debug, Clone)]
pub struct SectionList {
    sections: Vec<Section>,

    /// Section numbers in the requested range without a directory
    missing: Vec<u32>,
}

impl SectionList {
    /// Validate an already-resolved list: non-empty and strictly increasing.
    pub fn new(sections: Vec<Section>) -> PipelineResult<Self> {
        if sections.is_empty() {
            return Err(PipelineError::config("no sections to process"));
        }
        for w in sections.windows(2) {
            if w[1].num <= w[0].num {
                return Err(PipelineError::config(format!(
                    "sections out of order: s{} follows s{}",
                    w[1].num, w[0].num
                )));
            }
        }
        Ok(Self {
            sections,
            missing: Vec::new(),
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn into_sections(self) -> Vec<Section> {
        self.sections
    }

    pub fn missing(&self) -> &[u32] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

/// Parse a section directory name of the form `s{num}_g{grid}`.
pub fn parse_section_dir_name(name: &str) -> Option<(u32, u32)> {
    let (s, g) = name.split_once('_')?;
    let num = s.strip_prefix('s')?.parse().ok()?;
    let grid = g.strip_prefix('g')?.parse().ok()?;
    Some((num, grid))
}

/// Section numbers in `[start, end]` not present in `found`.
pub fn missing_sections(found: &[u32], start: u32, end: u32) -> Vec<u32> {
    let present: HashSet<u32> = found.iter().copied().collect();
    (start..=end).filter(|n| !present.contains(n)).collect()
}

/// Loads the section list from the input configuration.
pub struct SectionListLoader;

impl SectionListLoader {
    /// Scan `section_dir`, filter to the configured range and validate it.
    ///
    /// When `require_layout` is set every section must carry a
    /// `section.yaml` tile layout.
    pub fn load(input: &InputConfig, require_layout: bool) -> PipelineResult<SectionList> {
        let dir = Path::new(&input.section_dir);
        let entries = std::fs::read_dir(dir).map_err(|e| {
            PipelineError::config(format!("cannot read section_dir {}: {}", dir.display(), e))
        })?;

        let mut by_num: BTreeMap<u32, Section> = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some((num, grid)) = name.to_str().and_then(parse_section_dir_name) else {
                tracing::debug!("Ignoring non-section entry {:?}", name);
                continue;
            };
            if num < input.start_section || num > input.end_section {
                continue;
            }

            let path = entry.path();
            let layout = Self::load_layout(&path)?;
            if require_layout && layout.is_none() {
                return Err(PipelineError::config(format!(
                    "section s{} has no {}",
                    num, SECTION_LAYOUT_FILE
                )));
            }

            let section = Section {
                num,
                grid,
                path: path.to_string_lossy().into_owned(),
                layout,
            };
            if let Some(prev) = by_num.insert(num, section) {
                return Err(PipelineError::config(format!(
                    "section s{} appears twice (grids g{} and g{})",
                    num, prev.grid, grid
                )));
            }
        }

        let found: Vec<u32> = by_num.keys().copied().collect();
        let missing = missing_sections(&found, input.start_section, input.end_section);
        if !missing.is_empty() {
            if input.allow_missing {
                tracing::warn!(
                    "{} section(s) missing from s{}..=s{}: {:?}",
                    missing.len(),
                    input.start_section,
                    input.end_section,
                    missing
                );
            } else {
                return Err(PipelineError::config(format!(
                    "{} section(s) missing from s{}..=s{}: {:?}",
                    missing.len(),
                    input.start_section,
                    input.end_section,
                    missing
                )));
            }
        }

        let mut list = SectionList::new(by_num.into_values().collect())?;
        list.missing = missing;

        tracing::info!(
            "Loaded {} sections (s{}..=s{}) from {}",
            list.len(),
            input.start_section,
            input.end_section,
            dir.display()
        );
        Ok(list)
    }

    fn load_layout(section_path: &Path) -> PipelineResult<Option<TileLayout>> {
        let layout_path = section_path.join(SECTION_LAYOUT_FILE);
        if !layout_path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&layout_path)?;
        let layout: TileLayout = serde_yaml::from_str(&contents).map_err(|e| {
            PipelineError::config(format!("invalid {}: {}", layout_path.display(), e))
        })?;
        layout
            .validate()
            .map_err(|e| PipelineError::config(format!("invalid {}: {}", layout_path.display(), e)))?;
        Ok(Some(layout))
    }
}
