//! Spatial hash over block screen rectangles.
//!
//! The plane is cut into square regions of `region_size`. A rectangle is
//! filed under the region containing its top-left corner, so a query only
//! visits regions its range overlaps (extended up and left by the largest
//! rectangle seen, so tall or wide blocks that start off-range are found).
//!
//! ```text
//!   (0,0)   (1,0)   (2,0)
//!   ┌───────┬───────┬───────┐
//!   │ ▪a    │       │       │   a: top-left in (0,0)
//!   │   ┌───┼───┐   │       │   b: filed in (0,0), spans into (1,0)
//!   ├───┼───┼───┼───┼───────┤
//!   │   └───┼───┘   │ ▪c    │
//!   └───────┴───────┴───────┘
//! ```
//!
//! Overlap is boundary-inclusive in integer screen units:
//! `x + width - 1 >= x0 && x <= x1` (same for y).

use std::collections::HashMap;

use quire_types::{BlockId, BlockRect};
use tracing::trace;

type CellKey = (i64, i64);

/// Spatial index answering "which blocks intersect this rectangle".
#[derive(Debug, Clone)]
pub struct RegionGrid {
    region_size: f64,
    regions: HashMap<CellKey, Vec<BlockRect>>,
    /// Region currently holding each id.
    located: HashMap<BlockId, CellKey>,
    max_width: f64,
    max_height: f64,
}

impl RegionGrid {
    pub fn new(region_size: f64) -> Self {
        Self {
            region_size,
            regions: HashMap::new(),
            located: HashMap::new(),
            max_width: 0.0,
            max_height: 0.0,
        }
    }

    fn cell(&self, x: f64, y: f64) -> CellKey {
        (
            (x / self.region_size).floor() as i64,
            (y / self.region_size).floor() as i64,
        )
    }

    pub fn region_size(&self) -> f64 {
        self.region_size
    }

    pub fn len(&self) -> usize {
        self.located.len()
    }

    pub fn is_empty(&self) -> bool {
        self.located.is_empty()
    }

    /// Number of non-empty regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn get(&self, id: &BlockId) -> Option<&BlockRect> {
        let key = self.located.get(id)?;
        self.regions.get(key)?.iter().find(|r| r.id == *id)
    }

    /// File a rectangle. A rectangle already stored for the same id is replaced.
    ///
    /// Non-finite coordinates are rejected.
    pub fn add_block(&mut self, rect: BlockRect) -> bool {
        if ![rect.x, rect.y, rect.width, rect.height].iter().all(|v| v.is_finite()) {
            trace!("region grid: ignoring non-finite rect for {}", rect.id);
            return false;
        }
        if self.located.contains_key(&rect.id) {
            self.remove_block(&rect.id);
        }
        let key = self.cell(rect.x, rect.y);
        self.max_width = self.max_width.max(rect.width);
        self.max_height = self.max_height.max(rect.height);
        self.located.insert(rect.id.clone(), key);
        self.regions.entry(key).or_default().push(rect);
        true
    }

    /// Drop the rectangle stored for `id`.
    pub fn remove_block(&mut self, id: &BlockId) -> Option<BlockRect> {
        let key = self.located.remove(id)?;
        let region = self.regions.get_mut(&key)?;
        let pos = region.iter().position(|r| r.id == *id)?;
        let rect = region.swap_remove(pos);
        if region.is_empty() {
            self.regions.remove(&key);
        }
        Some(rect)
    }

    /// Replace the stored rectangle. Returns false (and does nothing) when the
    /// geometry is bit-identical to what is stored.
    pub fn update_block(&mut self, rect: BlockRect) -> bool {
        if self.get(&rect.id).is_some_and(|old| old.same_geometry(&rect)) {
            return false;
        }
        self.add_block(rect)
    }

    pub fn clear(&mut self) {
        self.regions.clear();
        self.located.clear();
        self.max_width = 0.0;
        self.max_height = 0.0;
    }

    /// Rectangles overlapping `x0..=x1` × `y0..=y1`, sorted top to bottom, then left to right.
    pub fn get_intersect_blocks(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<&BlockRect> {
        let (cx0, cy0) = self.cell(x0 - self.max_width, y0 - self.max_height);
        let (cx1, cy1) = self.cell(x1, y1);

        let mut hits: Vec<&BlockRect> = if cx1 < cx0 || cy1 < cy0 {
            Vec::new()
        } else {
            let cells = |lo: i64, hi: i64| (i128::from(hi) - i128::from(lo) + 1) as u128;
            let span = cells(cx0, cx1).saturating_mul(cells(cy0, cy1));
            let in_range = |key: &CellKey| (cx0..=cx1).contains(&key.0) && (cy0..=cy1).contains(&key.1);
            if span > self.regions.len() as u128 {
                // Sparse grid: walking populated regions is cheaper than the range.
                self.regions
                    .iter()
                    .filter(|(key, _)| in_range(key))
                    .flat_map(|(_, rects)| rects.iter())
                    .filter(|r| r.intersects(x0, y0, x1, y1))
                    .collect()
            } else {
                let mut hits = Vec::new();
                for cx in cx0..=cx1 {
                    for cy in cy0..=cy1 {
                        if let Some(rects) = self.regions.get(&(cx, cy)) {
                            hits.extend(rects.iter().filter(|r| r.intersects(x0, y0, x1, y1)));
                        }
                    }
                }
                hits
            }
        };

        hits.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
        hits
    }
}
