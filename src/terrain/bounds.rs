//! World-space tile extents.

use crate::terrain::coordinate::TileCoordinate;
use glam::Vec3;

/// World-space extent of the level-0 pyramid tile, in meters.
pub const ROOT_TILE_EXTENT: f32 = 1000.0;

/// Vertical band assumed for a tile before its height data is loaded.
pub const DEFAULT_MAX_ELEVATION: f32 = 200.0;

/// Edge length of one tile at `level`.
pub fn tile_extent(level: u32) -> f32 {
    ROOT_TILE_EXTENT / 2f32.powi(level as i32)
}

/// Axis-aligned world-space box of one tile, plus the elevation range it was
/// derived from. The Y span starts at the default band and is refined once
/// height data loads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub min: Vec3,
    pub max: Vec3,
    pub min_elevation: f32,
    pub max_elevation: f32,
}

impl TileBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min,
            max,
            min_elevation: 0.0,
            max_elevation: 0.0,
        }
    }

    /// Bounds derived purely from the tile coordinate.
    pub fn from_coordinate(coord: &TileCoordinate) -> Self {
        let extent = tile_extent(coord.level);
        Self {
            min: Vec3::new(coord.x as f32 * extent, 0.0, coord.y as f32 * extent),
            max: Vec3::new(
                (coord.x + 1) as f32 * extent,
                DEFAULT_MAX_ELEVATION,
                (coord.y + 1) as f32 * extent,
            ),
            min_elevation: 0.0,
            max_elevation: 0.0,
        }
    }

    /// Tighten the vertical extent to the observed elevation range.
    pub fn refine_elevation(&mut self, min_elevation: f32, max_elevation: f32) {
        self.min_elevation = min_elevation;
        self.max_elevation = max_elevation;
        self.min.y = min_elevation;
        self.max.y = max_elevation;
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Half-extents along each axis.
    pub fn extents(&self) -> Vec3 {
        self.size() * 0.5
    }

    /// Radius of the bounding sphere around the box center.
    pub fn radius(&self) -> f32 {
        self.size().length() * 0.5
    }

    pub fn intersects(&self, other: &TileBounds) -> bool {
        !(self.max.x < other.min.x
            || self.min.x > other.max.x
            || self.max.y < other.min.y
            || self.min.y > other.max.y
            || self.max.z < other.min.z
            || self.min.z > other.max.z)
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_from_coordinate() {
        let coord = TileCoordinate::new(2, -1, 0, "ds");
        let bounds = TileBounds::from_coordinate(&coord);
        assert_eq!(bounds.min, Vec3::new(2000.0, 0.0, -1000.0));
        assert_eq!(bounds.max, Vec3::new(3000.0, DEFAULT_MAX_ELEVATION, 0.0));
    }

    #[test]
    fn coarser_levels_cover_more_ground() {
        assert_eq!(tile_extent(0), 1000.0);
        assert_eq!(tile_extent(1), 500.0);
        assert_eq!(tile_extent(3), 125.0);
    }

    #[test]
    fn refine_elevation_updates_y_span() {
        let mut bounds = TileBounds::from_coordinate(&TileCoordinate::new(0, 0, 0, "ds"));
        bounds.refine_elevation(-12.5, 87.0);
        assert_eq!(bounds.min.y, -12.5);
        assert_eq!(bounds.max.y, 87.0);
        assert_eq!(bounds.min_elevation, -12.5);
        assert_eq!(bounds.max_elevation, 87.0);
    }

    #[test]
    fn disjoint_boxes_do_not_intersect() {
        let a = TileBounds::new(Vec3::splat(0.0), Vec3::splat(10.0));
        let b = TileBounds::new(Vec3::splat(20.0), Vec3::splat(30.0));
        assert!(!a.intersects(&b));
        assert!(a.intersects(&a));
    }
}
