//! Visibility determination: frustum culling and distance-banded LOD.
//!
//! Two cooperating paths produce per-object visibility: a CPU path over the
//! spatial hierarchy (or a flat object sweep when agreement with the GPU
//! matters) and an optional compute-dispatch path. When the compute pipeline
//! is unavailable every call transparently routes to the CPU — logged once,
//! not per frame.

pub mod frustum;
mod gpu;
pub mod quadtree;

pub use frustum::Frustum;
pub use gpu::GpuCuller;
pub use quadtree::{CullQuadtree, CullQuadtreeConfig, QuadtreeStatistics};

use crate::core::memory_pool::MemoryPoolAllocator;
use crate::gpu::GpuContext;
use crate::terrain::bounds::{tile_extent, TileBounds};
use crate::terrain::coordinate::TileCoordinate;
use glam::{Vec3, Vec4};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

/// One candidate for visibility: an id (tile slot, entity index, ...), its
/// world bounds and the LOD level its geometry was built for.
#[derive(Debug, Clone, PartialEq)]
pub struct CullingObject {
    pub id: u32,
    pub bounds: TileBounds,
    pub lod_level: u32,
}

/// Partition of the object set produced by one culling pass.
#[derive(Debug, Clone, Default)]
pub struct CullResults {
    pub visible: Vec<CullingObject>,
    pub culled: Vec<CullingObject>,
    pub cull_time_ms: f32,
}

/// Parameters shared by the CPU and GPU object-culling paths.
#[derive(Debug, Clone, Copy)]
pub struct CullingParams {
    pub lod_distances: [f32; 4],
    pub enable_frustum_culling: bool,
    pub enable_lod_culling: bool,
}

impl Default for CullingParams {
    fn default() -> Self {
        Self {
            lod_distances: [500.0, 1000.0, 2500.0, 5000.0],
            enable_frustum_culling: true,
            enable_lod_culling: false,
        }
    }
}

/// Culler-wide configuration.
#[derive(Debug, Clone)]
pub struct CullingConfig {
    pub params: CullingParams,
    pub enable_gpu_culling: bool,
    pub max_gpu_objects: u32,
    pub min_level: u32,
    pub max_level: u32,
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self {
            params: CullingParams::default(),
            enable_gpu_culling: true,
            max_gpu_objects: 100_000,
            min_level: 0,
            max_level: 7,
        }
    }
}

/// Number of band thresholds strictly exceeded by `distance`. A distance
/// exactly on a threshold belongs to the nearer (higher-detail) band.
pub fn banded_lod(distance: f32, lod_distances: &[f32; 4]) -> u32 {
    let mut level = 0u32;
    for &band in lod_distances {
        if distance > band {
            level += 1;
        }
    }
    level
}

/// Band selection clamped to the configured level range, for choosing the
/// pyramid level of a residency candidate.
pub fn lod_for_distance(
    distance: f32,
    lod_distances: &[f32; 4],
    min_level: u32,
    max_level: u32,
) -> u32 {
    banded_lod(distance, lod_distances).clamp(min_level, max_level)
}

pub struct VisibilityCuller {
    quadtree: CullQuadtree,
    config: CullingConfig,
    gpu_culler: Option<GpuCuller>,
    /// GPU-culling init is attempted once; failure disables it for the session.
    gpu_init_attempted: bool,
    fallback_logged: AtomicBool,
}

impl VisibilityCuller {
    pub fn new(quadtree_config: CullQuadtreeConfig, config: CullingConfig) -> Self {
        Self {
            quadtree: CullQuadtree::new(quadtree_config),
            config,
            gpu_culler: None,
            gpu_init_attempted: false,
            fallback_logged: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CullingConfig {
        &self.config
    }

    /// Try to bring up the compute-culling pipeline. A failure is terminal
    /// for the session: subsequent `cull` calls use the CPU path.
    pub fn enable_gpu_culling(&mut self, gpu: &GpuContext, allocator: Arc<MemoryPoolAllocator>) {
        if self.gpu_init_attempted || !self.config.enable_gpu_culling {
            return;
        }
        self.gpu_init_attempted = true;
        match GpuCuller::new(gpu, allocator, self.config.max_gpu_objects) {
            Ok(culler) => self.gpu_culler = Some(culler),
            Err(e) => {
                log::warn!("GPU culling unavailable, using CPU culling for this session: {e}");
            }
        }
    }

    pub fn gpu_culling_active(&self) -> bool {
        self.gpu_culler.is_some()
    }

    pub fn insert(&mut self, object: CullingObject) -> bool {
        self.quadtree.insert(object)
    }

    pub fn remove(&mut self, object_id: u32) -> bool {
        self.quadtree.remove(object_id)
    }

    pub fn clear(&mut self) {
        self.quadtree.clear()
    }

    pub fn object_count(&self) -> usize {
        self.quadtree.object_count()
    }

    pub fn statistics(&self) -> QuadtreeStatistics {
        self.quadtree.statistics()
    }

    /// Object-level culling with automatic path selection: the compute path
    /// when it is up (and the object set fits), otherwise the CPU sweep that
    /// replicates the shader math exactly.
    pub fn cull(
        &self,
        gpu: Option<&GpuContext>,
        frustum_planes: &[Vec4; 6],
        camera_position: Vec3,
    ) -> CullResults {
        let objects: Vec<CullingObject> = self.quadtree.objects().cloned().collect();

        if let (Some(culler), Some(gpu)) = (self.gpu_culler.as_ref(), gpu) {
            if objects.len() as u32 <= culler.max_objects() {
                match culler.cull(gpu, &objects, frustum_planes, camera_position, &self.config.params)
                {
                    Ok(results) => return results,
                    Err(e) => log::warn!("GPU culling pass failed, using CPU path: {e}"),
                }
            }
        } else if self.config.enable_gpu_culling
            && !self.fallback_logged.swap(true, AtomicOrdering::Relaxed)
        {
            log::warn!("GPU culling not available, falling back to CPU culling");
        }

        self.cull_objects_cpu(&objects, frustum_planes, camera_position)
    }

    /// CPU replica of the compute shader: per-object sphere-vs-frustum and
    /// band-match tests, no hierarchy shortcuts, so results agree with the
    /// GPU path bit for bit.
    pub fn cull_objects_cpu(
        &self,
        objects: &[CullingObject],
        frustum_planes: &[Vec4; 6],
        camera_position: Vec3,
    ) -> CullResults {
        let start = Instant::now();
        let params = &self.config.params;
        let mut results = CullResults::default();

        for object in objects {
            let mut visible = true;

            if params.enable_frustum_culling {
                let center = (object.bounds.min + object.bounds.max) * 0.5;
                let radius = (object.bounds.max - object.bounds.min).length() * 0.5;
                visible = sphere_in_planes(center, radius, frustum_planes);
            }

            if visible && params.enable_lod_culling {
                let center = (object.bounds.min + object.bounds.max) * 0.5;
                let distance = (center - camera_position).length();
                visible = object.lod_level == banded_lod(distance, &params.lod_distances);
            }

            if visible {
                results.visible.push(object.clone());
            } else {
                results.culled.push(object.clone());
            }
        }

        results.cull_time_ms = start.elapsed().as_secs_f32() * 1000.0;
        results
    }

    /// Recursive spatial-hierarchy culling: subtrees wholly outside the
    /// frustum are pruned without per-object tests. Conservative relative to
    /// [`Self::cull`] — use it for residency queries, not for parity checks.
    pub fn cull_hierarchy(&self, frustum: &Frustum) -> CullResults {
        self.quadtree.cull_frustum(frustum)
    }

    /// Pure distance-band LOD culling over all objects.
    pub fn cull_lod(&self, camera_position: Vec3) -> CullResults {
        self.quadtree
            .cull_lod(camera_position, &self.config.params.lod_distances)
    }

    /// Enumerate tile coordinates that should be resident for this camera:
    /// for every pyramid level in range, the tiles of the camera's
    /// surrounding ring that survive frustum and distance tests, nearest
    /// first, truncated to `max_tiles`.
    pub fn select_candidates(
        &self,
        camera_position: Vec3,
        frustum: &Frustum,
        dataset_id: &str,
        near_distance: f32,
        far_distance: f32,
        max_tiles: usize,
    ) -> Vec<TileCoordinate> {
        let mut candidates: Vec<(TileCoordinate, f32)> = Vec::new();
        let max_distance = far_distance;

        for level in self.config.min_level..=self.config.max_level {
            let level_distance = near_distance * 2f32.powi(level as i32);
            if level_distance > max_distance {
                break;
            }

            let extent = tile_extent(level);
            let min_x = ((camera_position.x - max_distance) / extent).floor() as i32 - 1;
            let max_x = ((camera_position.x + max_distance) / extent).ceil() as i32 + 1;
            let min_y = ((camera_position.z - max_distance) / extent).floor() as i32 - 1;
            let max_y = ((camera_position.z + max_distance) / extent).ceil() as i32 + 1;

            for y in min_y..=max_y {
                for x in min_x..=max_x {
                    let coord = TileCoordinate::new(x, y, level, dataset_id);
                    let bounds = TileBounds::from_coordinate(&coord);

                    if self.config.params.enable_frustum_culling
                        && !frustum.intersects_bounds(&bounds)
                    {
                        continue;
                    }
                    let distance = (camera_position - bounds.center()).length();
                    if distance > max_distance {
                        continue;
                    }
                    candidates.push((coord, distance));
                }
            }
        }

        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        candidates.truncate(max_tiles);
        candidates.into_iter().map(|(coord, _)| coord).collect()
    }
}

fn sphere_in_planes(center: Vec3, radius: f32, planes: &[Vec4; 6]) -> bool {
    for plane in planes {
        let distance = plane.truncate().dot(center) + plane.w;
        if distance < -radius {
            return false;
        }
    }
    true
}
