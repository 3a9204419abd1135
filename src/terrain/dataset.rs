//! Dataset-reader seam and the host-side tile payload cache.
//!
//! Decoding geospatial rasters is out of scope for this crate; sources
//! implement [`TileDataSource`] and hand back raw elevation grids. The
//! streaming workers consult [`TileDataCache`] before touching the source,
//! so re-resident tiles skip the (potentially slow) read entirely.

use crate::error::{TerrainError, TerrainResult};
use crate::terrain::coordinate::TileCoordinate;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Raw elevation payload for one tile, as produced by a dataset reader.
#[derive(Debug, Clone, PartialEq)]
pub struct TileSourceData {
    pub width: u32,
    pub height: u32,
    pub elevations: Vec<f32>,
    pub height_scale: f32,
}

impl TileSourceData {
    pub fn memory_usage(&self) -> u64 {
        (self.elevations.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Basic shape check; sources returning mismatched grids are treated as
    /// load failures rather than corrupting tile uploads downstream.
    pub fn validate(&self) -> TerrainResult<()> {
        let expected = self.width as usize * self.height as usize;
        if self.width == 0 || self.height == 0 {
            return Err(TerrainError::dataset("empty elevation grid"));
        }
        if self.elevations.len() != expected {
            return Err(TerrainError::dataset(format!(
                "elevation grid length mismatch: got {}, expected {}",
                self.elevations.len(),
                expected
            )));
        }
        Ok(())
    }
}

/// External collaborator that resolves a tile coordinate to elevation data.
/// Implementations own the coordinate→file mapping and the decode path.
pub trait TileDataSource: Send + Sync {
    fn load_tile_data(&self, coord: &TileCoordinate) -> TerrainResult<TileSourceData>;
}

/// Procedural height source: a deterministic two-octave sine pattern per
/// tile. Stands in for a real raster reader in demos and tests.
#[derive(Debug, Clone)]
pub struct SyntheticTileSource {
    pub tile_resolution: u32,
    pub height_scale: f32,
}

impl Default for SyntheticTileSource {
    fn default() -> Self {
        Self {
            tile_resolution: 512,
            height_scale: 100.0,
        }
    }
}

impl SyntheticTileSource {
    pub fn new(tile_resolution: u32, height_scale: f32) -> Self {
        Self {
            tile_resolution,
            height_scale,
        }
    }
}

impl TileDataSource for SyntheticTileSource {
    fn load_tile_data(&self, _coord: &TileCoordinate) -> TerrainResult<TileSourceData> {
        let size = self.tile_resolution;
        let mut elevations = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                let fx = x as f32 / size as f32;
                let fy = y as f32 / size as f32;
                let height = (fx * 6.28).sin() * (fy * 6.28).sin() * 50.0
                    + (fx * 12.56).sin() * (fy * 12.56).sin() * 25.0;
                elevations.push(height);
            }
        }
        Ok(TileSourceData {
            width: size,
            height: size,
            elevations,
            height_scale: self.height_scale,
        })
    }
}

/// Capacity-bounded LRU cache of decoded tile payloads, shared between the
/// streaming workers. Payloads are `Arc`-shared so a hit costs a pointer
/// clone, not a grid copy.
pub struct TileDataCache {
    capacity: usize,
    data: HashMap<TileCoordinate, Arc<TileSourceData>>,
    access_order: VecDeque<TileCoordinate>,
    total_bytes: u64,
}

/// Cache occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub current_size: usize,
    pub memory_usage_bytes: u64,
}

impl TileDataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: HashMap::new(),
            access_order: VecDeque::new(),
            total_bytes: 0,
        }
    }

    /// Insert a payload, evicting least-recently-used entries at capacity.
    pub fn insert(&mut self, coord: TileCoordinate, payload: Arc<TileSourceData>) {
        if self.capacity == 0 {
            return;
        }
        if let Some(old) = self.data.remove(&coord) {
            self.access_order.retain(|c| c != &coord);
            self.total_bytes -= old.memory_usage();
        }
        while self.data.len() >= self.capacity {
            match self.access_order.pop_front() {
                Some(oldest) => {
                    if let Some(old) = self.data.remove(&oldest) {
                        self.total_bytes -= old.memory_usage();
                    }
                }
                None => break,
            }
        }
        self.total_bytes += payload.memory_usage();
        self.data.insert(coord.clone(), payload);
        self.access_order.push_back(coord);
    }

    /// Fetch a payload, marking it most recently used.
    pub fn get(&mut self, coord: &TileCoordinate) -> Option<Arc<TileSourceData>> {
        if !self.data.contains_key(coord) {
            return None;
        }
        self.access_order.retain(|c| c != coord);
        self.access_order.push_back(coord.clone());
        self.data.get(coord).cloned()
    }

    /// Presence check without touching the access order.
    pub fn contains(&self, coord: &TileCoordinate) -> bool {
        self.data.contains_key(coord)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity,
            current_size: self.data.len(),
            memory_usage_bytes: self.total_bytes,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.access_order.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: f32) -> Arc<TileSourceData> {
        Arc::new(TileSourceData {
            width: 8,
            height: 8,
            elevations: vec![value; 64],
            height_scale: 1.0,
        })
    }

    fn coord(x: i32, y: i32) -> TileCoordinate {
        TileCoordinate::new(x, y, 0, "ds")
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = TileDataCache::new(2);
        cache.insert(coord(0, 0), payload(1.0));
        cache.insert(coord(1, 0), payload(2.0));

        // Touch (0,0) so (1,0) becomes the LRU entry.
        assert!(cache.get(&coord(0, 0)).is_some());
        cache.insert(coord(0, 1), payload(3.0));

        assert!(cache.contains(&coord(0, 0)));
        assert!(!cache.contains(&coord(1, 0)));
        assert!(cache.contains(&coord(0, 1)));
        assert_eq!(cache.stats().current_size, 2);
    }

    #[test]
    fn reinsert_replaces_without_leaking_bytes() {
        let mut cache = TileDataCache::new(4);
        cache.insert(coord(0, 0), payload(1.0));
        let before = cache.stats().memory_usage_bytes;
        cache.insert(coord(0, 0), payload(2.0));
        assert_eq!(cache.stats().memory_usage_bytes, before);
        assert_eq!(cache.stats().current_size, 1);
    }

    #[test]
    fn synthetic_source_is_deterministic() {
        let source = SyntheticTileSource::new(64, 1.0);
        let c = coord(0, 0);
        let a = source.load_tile_data(&c).unwrap();
        let b = source.load_tile_data(&c).unwrap();
        assert_eq!(a, b);
        a.validate().unwrap();
        assert_eq!(a.elevations.len(), 64 * 64);
    }

    #[test]
    fn mismatched_grid_fails_validation() {
        let bad = TileSourceData {
            width: 4,
            height: 4,
            elevations: vec![0.0; 15],
            height_scale: 1.0,
        };
        assert!(bad.validate().is_err());
    }
}
