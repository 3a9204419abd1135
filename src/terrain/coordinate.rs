//! Tile addressing in the quadtree LOD pyramid.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one tile of one dataset: grid position `(x, y)` at a pyramid
/// `level` (0 = finest detail; higher levels are coarser). Immutable value
/// key — equality and hashing cover all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoordinate {
    pub x: i32,
    pub y: i32,
    pub level: u32,
    pub dataset_id: String,
}

impl TileCoordinate {
    pub fn new(x: i32, y: i32, level: u32, dataset_id: impl Into<String>) -> Self {
        Self {
            x,
            y,
            level,
            dataset_id: dataset_id.into(),
        }
    }

    /// The covering tile one level coarser.
    pub fn parent(&self) -> TileCoordinate {
        TileCoordinate::new(self.x / 2, self.y / 2, self.level + 1, self.dataset_id.clone())
    }

    /// The four covered tiles one level finer; `None` at the finest level.
    pub fn children(&self) -> Option<[TileCoordinate; 4]> {
        if self.level == 0 {
            return None;
        }
        let level = self.level - 1;
        let (x, y) = (self.x * 2, self.y * 2);
        Some([
            TileCoordinate::new(x, y, level, self.dataset_id.clone()),
            TileCoordinate::new(x + 1, y, level, self.dataset_id.clone()),
            TileCoordinate::new(x, y + 1, level, self.dataset_id.clone()),
            TileCoordinate::new(x + 1, y + 1, level, self.dataset_id.clone()),
        ])
    }

    /// The eight same-level neighbors (edge + corner).
    pub fn neighbors(&self) -> [TileCoordinate; 8] {
        let mk = |dx: i32, dy: i32| {
            TileCoordinate::new(self.x + dx, self.y + dy, self.level, self.dataset_id.clone())
        };
        [
            mk(-1, 0),
            mk(1, 0),
            mk(0, -1),
            mk(0, 1),
            mk(-1, -1),
            mk(1, -1),
            mk(-1, 1),
            mk(1, 1),
        ]
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.dataset_id, self.level, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_child_roundtrip() {
        let coord = TileCoordinate::new(3, 5, 1, "ds");
        let children = coord.children().unwrap();
        assert_eq!(children[0], TileCoordinate::new(6, 10, 0, "ds"));
        assert_eq!(children[3], TileCoordinate::new(7, 11, 0, "ds"));
        for child in children {
            assert_eq!(child.parent(), coord);
        }
    }

    #[test]
    fn finest_level_has_no_children() {
        assert!(TileCoordinate::new(0, 0, 0, "ds").children().is_none());
    }

    #[test]
    fn equality_covers_dataset() {
        let a = TileCoordinate::new(1, 2, 3, "a");
        let b = TileCoordinate::new(1, 2, 3, "b");
        assert_ne!(a, b);
    }

    #[test]
    fn display_key() {
        let coord = TileCoordinate::new(-2, 7, 3, "srtm");
        assert_eq!(coord.to_string(), "srtm_3_-2_7");
    }
}
