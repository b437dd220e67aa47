//! Screen-space block rectangles.

use serde::{Deserialize, Serialize};

use crate::ids::BlockId;

/// A rendered block's rectangle in document (scroll-independent) pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRect {
    pub id: BlockId,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BlockRect {
    pub fn new(id: impl Into<BlockId>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            width,
            height,
        }
    }

    /// Bit-identical geometry comparison (ignores id).
    ///
    /// Raw-bit comparison: `-0.0` and `0.0` differ, identical NaNs match.
    pub fn same_geometry(&self, other: &BlockRect) -> bool {
        self.x.to_bits() == other.x.to_bits()
            && self.y.to_bits() == other.y.to_bits()
            && self.width.to_bits() == other.width.to_bits()
            && self.height.to_bits() == other.height.to_bits()
    }

    /// Inclusive-boundary overlap with the query box `[x0, x1] × [y0, y1]`.
    pub fn intersects(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> bool {
        self.x + self.width - 1.0 >= x0
            && self.x <= x1
            && self.y + self.height - 1.0 >= y0
            && self.y <= y1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touching_boundary_intersects() {
        // Occupies pixels 100..=150.
        let rect = BlockRect::new("a", 100.0, 0.0, 51.0, 20.0);
        assert!(rect.intersects(150.0, 0.0, 200.0, 10.0));
        assert!(!rect.intersects(151.0, 0.0, 200.0, 10.0));
    }

    #[test]
    fn test_same_geometry_ignores_id() {
        let a = BlockRect::new("a", 1.0, 2.0, 3.0, 4.0);
        let b = BlockRect::new("b", 1.0, 2.0, 3.0, 4.0);
        assert!(a.same_geometry(&b));
        assert!(!a.same_geometry(&BlockRect::new("a", 1.0, 2.0, 3.0, 4.5)));
    }
}
