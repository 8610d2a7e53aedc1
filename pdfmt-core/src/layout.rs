//! Per-page occupancy grid built from layout detection.
//!
//! Rather than building a spatial index for point-in-region queries while a
//! content stream is rewritten, the detected boxes are rasterized into a dense
//! grid so every glyph position is classified with a single lookup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Cell value for regions that must never be altered.
pub const PROTECTED: u32 = 0;
/// Cell value for unclassified background.
pub const BACKGROUND: u32 = 1;
/// Smallest text-block id; box `i` gets `FIRST_BLOCK_ID + i`.
pub const FIRST_BLOCK_ID: u32 = 2;

/// Classes whose footprint is protected by default.
pub const DEFAULT_PROTECTED_LABELS: [&str; 5] = [
    "abandon",
    "figure",
    "table",
    "isolate_formula",
    "formula_caption",
];

/// A classified, axis-aligned box in image coordinates (origin top-left).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutBox {
    pub label: String,
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl LayoutBox {
    pub fn new(label: impl Into<String>, x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            label: label.into(),
            x0,
            y0,
            x1,
            y1,
        }
    }
}

/// Dense page classification raster. Row `0` is the bottom of the page.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyGrid {
    width: usize,
    height: usize,
    cells: Vec<u32>,
}

impl OccupancyGrid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![BACKGROUND; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, col: usize, row: usize) -> Option<u32> {
        if col < self.width && row < self.height {
            Some(self.cells[row * self.width + col])
        } else {
            None
        }
    }

    /// Classify a point given in page space (origin bottom-left, units of
    /// the page box). Points outside the page are clamped to its edge.
    pub fn at_point(&self, x: f32, y: f32, page_width: f32, page_height: f32) -> u32 {
        if self.width == 0 || self.height == 0 || page_width <= 0.0 || page_height <= 0.0 {
            return BACKGROUND;
        }
        let col = clip((x * self.width as f32 / page_width) as i64, self.width);
        let row = clip((y * self.height as f32 / page_height) as i64, self.height);
        self.cells[row * self.width + col]
    }

    /// Cell-space bounds `(col0, row0, col1, row1)` of a block id, inclusive.
    pub fn block_bounds(&self, id: u32) -> Option<(usize, usize, usize, usize)> {
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for (index, &cell) in self.cells.iter().enumerate() {
            if cell != id {
                continue;
            }
            let (col, row) = (index % self.width, index / self.width);
            bounds = Some(match bounds {
                None => (col, row, col, row),
                Some((c0, r0, c1, r1)) => (c0.min(col), r0.min(row), c1.max(col), r1.max(row)),
            });
        }
        bounds
    }

    /// Distinct text-block ids present in the grid.
    pub fn block_ids(&self) -> BTreeSet<u32> {
        self.cells
            .iter()
            .copied()
            .filter(|&cell| cell >= FIRST_BLOCK_ID)
            .collect()
    }

    fn fill(&mut self, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>, value: u32) {
        for row in rows {
            let start = row * self.width;
            for cell in &mut self.cells[start + cols.start..start + cols.end] {
                *cell = value;
            }
        }
    }
}

fn clip(value: i64, len: usize) -> usize {
    value.clamp(0, len.saturating_sub(1) as i64) as usize
}

/// Turns detected boxes into an [`OccupancyGrid`].
pub struct LayoutAnalyzer {
    protected_labels: Vec<String>,
}

impl Default for LayoutAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_PROTECTED_LABELS.iter().map(|l| l.to_string()).collect())
    }
}

impl LayoutAnalyzer {
    pub fn new(protected_labels: Vec<String>) -> Self {
        Self { protected_labels }
    }

    pub fn is_protected(&self, label: &str) -> bool {
        self.protected_labels.iter().any(|l| l == label)
    }

    /// Build the grid for an image of `width` x `height` pixels.
    ///
    /// Text-block ids are written first; protected boxes are written
    /// afterwards so they always win where the two overlap.
    pub fn analyze(&self, width: usize, height: usize, boxes: &[LayoutBox]) -> OccupancyGrid {
        let mut grid = OccupancyGrid::new(width, height);
        if width == 0 || height == 0 {
            return grid;
        }

        for (index, layout_box) in boxes.iter().enumerate() {
            if !self.is_protected(&layout_box.label) {
                let (rows, cols) = flipped_footprint(layout_box, width, height);
                grid.fill(rows, cols, index as u32 + FIRST_BLOCK_ID);
            }
        }
        for layout_box in boxes {
            if self.is_protected(&layout_box.label) {
                let (rows, cols) = flipped_footprint(layout_box, width, height);
                grid.fill(rows, cols, PROTECTED);
            }
        }

        log::debug!(
            "Occupancy grid {}x{} from {} boxes, {} text blocks",
            width,
            height,
            boxes.len(),
            grid.block_ids().len()
        );
        grid
    }
}

/// Expand by one pixel, clip to the image and flip the vertical axis.
fn flipped_footprint(
    layout_box: &LayoutBox,
    width: usize,
    height: usize,
) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let h = height as f32;
    let x0 = clip((layout_box.x0 - 1.0) as i64, width);
    let y0 = clip((h - layout_box.y1 - 1.0) as i64, height);
    let x1 = clip((layout_box.x1 + 1.0) as i64, width);
    let y1 = clip((h - layout_box.y0 + 1.0) as i64, height);
    (y0..y1.max(y0), x0..x1.max(x0))
}
