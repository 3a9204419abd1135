//! Tile registry: residency, LRU eviction and load scheduling.
//!
//! The manager is the single mutation point for tile state. Streaming
//! workers only ever see coordinates and payloads; their completions are
//! applied here, on the thread that owns the manager, which keeps the
//! registry a plain map with no lock hierarchy.

use crate::core::memory_pool::MemoryPoolAllocator;
use crate::gpu::GpuContext;
use crate::terrain::bounds::TileBounds;
use crate::terrain::coordinate::TileCoordinate;
use crate::terrain::streaming::{LoadRequest, StreamingScheduler};
use crate::terrain::tile::{TerrainTile, TileState};
use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TileManagerConfig {
    /// Hard cap on resident tiles, enforced after every creation.
    pub max_resident_tiles: usize,
    /// CPU-side byte budget targeted by periodic cleanup.
    pub max_cpu_memory: u64,
    /// Tiles unused for this many frames are evicted by frame bookkeeping.
    pub stale_frame_threshold: u32,
}

impl Default for TileManagerConfig {
    fn default() -> Self {
        Self {
            max_resident_tiles: 1000,
            max_cpu_memory: 1024 * 1024 * 1024,
            stale_frame_threshold: 300,
        }
    }
}

/// Registry snapshot exposed to the renderer/orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileManagerStats {
    pub total_tiles: u32,
    pub ready_tiles: u32,
    pub loading_tiles: u32,
    pub error_tiles: u32,
    pub memory_usage: u64,
    pub gpu_memory_usage: u64,
}

pub struct TerrainTileManager {
    tiles: HashMap<TileCoordinate, TerrainTile>,
    config: TileManagerConfig,
    allocator: Arc<MemoryPoolAllocator>,
    insertion_counter: u64,
}

impl TerrainTileManager {
    pub fn new(config: TileManagerConfig, allocator: Arc<MemoryPoolAllocator>) -> Self {
        Self {
            tiles: HashMap::new(),
            config: TileManagerConfig {
                max_resident_tiles: config.max_resident_tiles.max(1),
                ..config
            },
            allocator,
            insertion_counter: 0,
        }
    }

    pub fn allocator(&self) -> &Arc<MemoryPoolAllocator> {
        &self.allocator
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Lookup only; never creates.
    pub fn get_tile(&self, coordinate: &TileCoordinate) -> Option<&TerrainTile> {
        self.tiles.get(coordinate)
    }

    pub fn get_tile_mut(&mut self, coordinate: &TileCoordinate) -> Option<&mut TerrainTile> {
        self.tiles.get_mut(coordinate)
    }

    /// Idempotent creation: returns the existing tile when present,
    /// otherwise constructs one in `Empty` state and enforces the
    /// resident-tile cap.
    pub fn create_tile(&mut self, coordinate: TileCoordinate) -> &mut TerrainTile {
        if !self.tiles.contains_key(&coordinate) {
            self.insertion_counter += 1;
            let mut tile = TerrainTile::new(coordinate.clone());
            tile.set_sequence(self.insertion_counter);
            self.tiles.insert(coordinate.clone(), tile);
            self.enforce_limits();
        }
        // LRU ties break toward older insertions, so with a cap of at least
        // one the tile just inserted always survives enforcement.
        self.tiles
            .get_mut(&coordinate)
            .expect("newest tile survives cap enforcement")
    }

    /// Evict and erase. Never fails; unknown coordinates are a no-op.
    pub fn remove_tile(&mut self, coordinate: &TileCoordinate) {
        if let Some(mut tile) = self.tiles.remove(coordinate) {
            let allocator = self.allocator.clone();
            tile.evict_from_memory(&allocator);
        }
    }

    pub fn remove_all_tiles(&mut self) {
        let allocator = self.allocator.clone();
        for (_, mut tile) in self.tiles.drain() {
            tile.evict_from_memory(&allocator);
        }
    }

    /// Remove every tile of one dataset (dataset unload).
    pub fn remove_dataset(&mut self, dataset_id: &str) {
        let coords: Vec<TileCoordinate> = self
            .tiles
            .keys()
            .filter(|c| c.dataset_id == dataset_id)
            .cloned()
            .collect();
        for coord in coords {
            self.remove_tile(&coord);
        }
    }

    /// Resident tiles whose bounds pass the frustum-plane test.
    pub fn get_visible_tiles(&self, frustum_planes: &[Vec4; 6]) -> Vec<&TerrainTile> {
        self.tiles
            .values()
            .filter(|tile| tile.is_visible(frustum_planes))
            .collect()
    }

    pub fn get_tiles_by_lod(&self, level: u32) -> Vec<&TerrainTile> {
        self.tiles
            .values()
            .filter(|tile| tile.coordinate().level == level)
            .collect()
    }

    pub fn get_tiles_in_bounds(&self, bounds: &TileBounds) -> Vec<&TerrainTile> {
        self.tiles
            .values()
            .filter(|tile| tile.bounds().intersects(bounds))
            .collect()
    }

    pub fn update_priorities(&mut self, camera_position: Vec3, delta_time: f32) {
        for tile in self.tiles.values_mut() {
            tile.update_priority(camera_position, delta_time);
        }
    }

    /// Up to `max_count` coordinates awaiting a load (`Empty`/`Evicted`),
    /// highest priority first; equal priorities keep insertion order.
    pub fn get_high_priority_loading_queue(&self, max_count: usize) -> Vec<TileCoordinate> {
        let mut waiting: Vec<&TerrainTile> = self
            .tiles
            .values()
            .filter(|tile| tile.state().is_loadable())
            .collect();

        waiting.sort_by(|a, b| {
            b.priority()
                .partial_cmp(&a.priority())
                .unwrap_or(Ordering::Equal)
                .then(a.sequence().cmp(&b.sequence()))
        });

        waiting
            .into_iter()
            .take(max_count)
            .map(|tile| tile.coordinate().clone())
            .collect()
    }

    /// The `count` least recently used tiles: largest `frames_since_access`
    /// first, ties by insertion order.
    pub fn get_lru_tiles(&self, count: usize) -> Vec<TileCoordinate> {
        let mut tiles: Vec<&TerrainTile> = self.tiles.values().collect();
        tiles.sort_by(|a, b| {
            b.frames_since_access()
                .cmp(&a.frames_since_access())
                .then(a.sequence().cmp(&b.sequence()))
        });
        tiles
            .into_iter()
            .take(count)
            .map(|tile| tile.coordinate().clone())
            .collect()
    }

    /// Evict least-recently-used tiles until CPU memory usage is at or
    /// below `target_bytes`. Best effort: stops when nothing evictable
    /// remains.
    pub fn perform_memory_cleanup(&mut self, target_bytes: u64) {
        if self.total_memory_usage() <= target_bytes {
            return;
        }
        let order = self.get_lru_tiles(self.tiles.len());
        let allocator = self.allocator.clone();
        for coord in order {
            if self.total_memory_usage() <= target_bytes {
                break;
            }
            if let Some(tile) = self.tiles.get_mut(&coord) {
                if tile.memory_usage() > 0 {
                    tile.evict_from_memory(&allocator);
                }
            }
        }
    }

    pub fn total_memory_usage(&self) -> u64 {
        self.tiles.values().map(|tile| tile.memory_usage()).sum()
    }

    pub fn total_gpu_memory_usage(&self) -> u64 {
        self.tiles.values().map(|tile| tile.gpu_memory_usage()).sum()
    }

    pub fn get_stats(&self) -> TileManagerStats {
        let mut stats = TileManagerStats {
            total_tiles: self.tiles.len() as u32,
            ..Default::default()
        };
        for tile in self.tiles.values() {
            match tile.state() {
                TileState::Ready => stats.ready_tiles += 1,
                TileState::Loading | TileState::Uploading => stats.loading_tiles += 1,
                TileState::Error => stats.error_tiles += 1,
                _ => {}
            }
            stats.memory_usage += tile.memory_usage();
            stats.gpu_memory_usage += tile.gpu_memory_usage();
        }
        stats
    }

    /// LRU eviction against the resident-tile cap; evicted tiles are erased.
    pub fn enforce_limits(&mut self) {
        if self.tiles.len() <= self.config.max_resident_tiles {
            return;
        }
        let excess = self.tiles.len() - self.config.max_resident_tiles;
        for coord in self.get_lru_tiles(excess) {
            log::debug!("cap eviction of {coord}");
            self.remove_tile(&coord);
        }
    }

    /// Per-frame bookkeeping: age every tile's access counter and evict
    /// tiles idle past the staleness threshold.
    pub fn begin_frame(&mut self) {
        let allocator = self.allocator.clone();
        for tile in self.tiles.values_mut() {
            tile.increment_frame_counter();
            if tile.frames_since_access() > self.config.stale_frame_threshold
                && tile.state() != TileState::Error
                && (tile.memory_usage() > 0 || tile.gpu_memory_usage() > 0)
            {
                tile.evict_from_memory(&allocator);
            }
        }
    }

    /// Push the highest-priority waiting coordinates to the scheduler,
    /// marking each as `Loading`. Stops early when the request queue fills.
    /// Returns how many loads were dispatched.
    pub fn schedule_streaming(
        &mut self,
        scheduler: &StreamingScheduler,
        max_requests: usize,
    ) -> usize {
        let wanted = self.get_high_priority_loading_queue(max_requests);
        let mut dispatched = 0;
        for coordinate in wanted {
            let Some(tile) = self.tiles.get_mut(&coordinate) else { continue };
            let Ok(generation) = tile.mark_loading() else { continue };

            let request = LoadRequest {
                coordinate: coordinate.clone(),
                generation,
            };
            match scheduler.request_load(request) {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    tile.abort_loading();
                    log::debug!("load queue full, deferring {coordinate}: {e}");
                    break;
                }
            }
        }
        dispatched
    }

    /// Apply completed loads and promote freshly loaded tiles to the GPU,
    /// at most `max_uploads` per call so a burst of completions cannot
    /// stall the frame. Load failures mark the tile `Error` and are not
    /// retried until it is removed and recreated. Returns
    /// `(applied, uploaded)`.
    pub fn integrate_completions(
        &mut self,
        scheduler: &StreamingScheduler,
        gpu: Option<&GpuContext>,
        max_uploads: usize,
    ) -> (usize, usize) {
        let mut applied = 0;
        let mut uploaded = 0;
        let allocator = self.allocator.clone();

        for completion in scheduler.poll_completions() {
            let Some(tile) = self.tiles.get_mut(&completion.coordinate) else {
                // Tile was removed while its load was in flight; the result
                // is discarded.
                continue;
            };

            let _ = tile.finish_load(completion.generation, completion.result, completion.duration);
            applied += 1;

            if tile.state() == TileState::Loaded {
                if let Some(gpu) = gpu {
                    if uploaded < max_uploads {
                        match tile.upload_to_gpu(gpu, &allocator) {
                            Ok(()) => uploaded += 1,
                            Err(e) => log::warn!(
                                "GPU upload failed for {}: {e}",
                                completion.coordinate
                            ),
                        }
                    }
                }
            }
        }
        (applied, uploaded)
    }
}
