//! Terrain tile lifecycle: load, GPU upload, render, evict.

use crate::core::memory_pool::{MemoryPoolAllocator, PoolAllocation, PoolKind};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::GpuContext;
use crate::terrain::bounds::{tile_extent, TileBounds};
use crate::terrain::coordinate::TileCoordinate;
use crate::terrain::dataset::{TileDataSource, TileSourceData};
use crate::terrain::stats::elevation_range;
use glam::{Vec3, Vec4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Vertex resolution of the tessellation base mesh.
pub const VERTICES_PER_SIDE: u32 = 64;

/// Frames of recency that still earn a scheduling bonus.
const RECENCY_WINDOW: f32 = 100.0;

/// Tile loading and rendering states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// Not loaded, no data
    Empty,
    /// Load claimed by a streaming worker
    Loading,
    /// Elevation data resident in system memory
    Loaded,
    /// GPU resource creation in progress
    Uploading,
    /// GPU resources ready for rendering
    Ready,
    /// Load or upload failed; terminal until the tile is removed
    Error,
    /// Data evicted; functionally an empty restart point
    Evicted,
}

impl TileState {
    /// States from which a load may begin.
    pub fn is_loadable(self) -> bool {
        matches!(self, TileState::Empty | TileState::Evicted)
    }
}

/// CPU-side elevation payload. Present while the tile is in
/// `Loaded`/`Uploading`/`Ready`; cleared on eviction.
#[derive(Debug, Clone)]
pub struct TileCpuData {
    payload: Arc<TileSourceData>,
}

impl TileCpuData {
    pub fn width(&self) -> u32 {
        self.payload.width
    }

    pub fn height(&self) -> u32 {
        self.payload.height
    }

    pub fn height_scale(&self) -> f32 {
        self.payload.height_scale
    }

    pub fn elevations(&self) -> &[f32] {
        &self.payload.elevations
    }

    pub fn memory_usage(&self) -> u64 {
        self.payload.memory_usage()
    }
}

/// Base-mesh vertex: world-space position, patch UV, up normal. Heights are
/// sampled from the height texture in the (external) tessellation stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TileVertex {
    pub position: [f32; 3],
    pub tex_coord: [f32; 2],
    pub normal: [f32; 3],
}

/// GPU resources owned by a `Ready` tile. All backing bytes are reserved
/// through the typed memory pools and returned on release.
pub struct TileGpuResources {
    pub vertex_buffer: wgpu::Buffer,
    pub vertex_count: u32,
    pub height_texture: wgpu::Texture,
    pub height_view: wgpu::TextureView,
    pub normal_texture: wgpu::Texture,
    pub normal_view: wgpu::TextureView,
    /// Texture bind group, the per-tile descriptor handed to the render pass.
    pub bind_group: wgpu::BindGroup,
    allocations: Vec<PoolAllocation>,
    total_gpu_bytes: u64,
}

impl TileGpuResources {
    pub fn total_gpu_bytes(&self) -> u64 {
        self.total_gpu_bytes
    }
}

pub struct TerrainTile {
    coordinate: TileCoordinate,
    state: TileState,
    bounds: TileBounds,
    cpu: Option<TileCpuData>,
    gpu: Option<TileGpuResources>,

    priority: f32,
    /// Reset by `render` from the render thread while the bookkeeping pass
    /// increments it, hence atomic; everything else is single-thread mutated
    /// through the manager.
    frames_since_access: AtomicU32,

    load_generation: u64,
    load_duration: Option<Duration>,
    error_message: Option<String>,

    /// Registry insertion sequence; identifies the instance and breaks LRU
    /// ties deterministically.
    sequence: u64,
}

impl TerrainTile {
    pub fn new(coordinate: TileCoordinate) -> Self {
        let bounds = TileBounds::from_coordinate(&coordinate);
        Self {
            coordinate,
            state: TileState::Empty,
            bounds,
            cpu: None,
            gpu: None,
            priority: 0.0,
            frames_since_access: AtomicU32::new(0),
            load_generation: 0,
            load_duration: None,
            error_message: None,
            sequence: 0,
        }
    }

    pub fn coordinate(&self) -> &TileCoordinate {
        &self.coordinate
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn bounds(&self) -> &TileBounds {
        &self.bounds
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.state == TileState::Error
    }

    pub fn load_duration(&self) -> Option<Duration> {
        self.load_duration
    }

    pub fn cpu_data(&self) -> Option<&TileCpuData> {
        self.cpu.as_ref()
    }

    pub fn gpu_resources(&self) -> Option<&TileGpuResources> {
        self.gpu.as_ref()
    }

    pub fn has_valid_gpu_resources(&self) -> bool {
        self.state == TileState::Ready && self.gpu.is_some()
    }

    pub fn memory_usage(&self) -> u64 {
        self.cpu.as_ref().map(|c| c.memory_usage()).unwrap_or(0)
    }

    pub fn gpu_memory_usage(&self) -> u64 {
        self.gpu.as_ref().map(|g| g.total_gpu_bytes).unwrap_or(0)
    }

    pub fn frames_since_access(&self) -> u32 {
        self.frames_since_access.load(Ordering::Relaxed)
    }

    pub fn mark_accessed(&self) {
        self.frames_since_access.store(0, Ordering::Relaxed);
    }

    pub fn increment_frame_counter(&self) {
        self.frames_since_access.fetch_add(1, Ordering::Relaxed);
    }

    /// Registry insertion sequence; identifies this instance and breaks
    /// LRU ties deterministically.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn generation(&self) -> u64 {
        self.load_generation
    }

    /// Claim the tile for loading. Each claim stamps a fresh generation so a
    /// result from a superseded load can never be applied.
    pub(crate) fn mark_loading(&mut self) -> TerrainResult<u64> {
        if !self.state.is_loadable() {
            return Err(TerrainError::InvalidState {
                expected: TileState::Empty,
                found: self.state,
            });
        }
        self.load_generation += 1;
        self.state = TileState::Loading;
        Ok(self.load_generation)
    }

    /// Back out of a `Loading` claim whose request could not be enqueued.
    /// The bumped generation stands, so a worker that somehow saw the
    /// request anyway produces a discarded completion.
    pub(crate) fn abort_loading(&mut self) {
        if self.state == TileState::Loading {
            self.state = TileState::Evicted;
        }
    }

    /// Apply the outcome of a load claimed with the matching generation.
    /// Stale completions (generation mismatch, or the tile left `Loading` in
    /// the meantime) are discarded without touching the tile.
    pub(crate) fn finish_load(
        &mut self,
        generation: u64,
        result: TerrainResult<Arc<TileSourceData>>,
        duration: Duration,
    ) -> TerrainResult<()> {
        if self.state != TileState::Loading || generation != self.load_generation {
            log::debug!(
                "discarding stale load result for {} (generation {generation})",
                self.coordinate
            );
            return Ok(());
        }
        match result {
            Ok(payload) => {
                if let Err(e) = payload.validate() {
                    self.set_error(e.to_string());
                    return Err(e);
                }
                if let Some((lo, hi)) = elevation_range(&payload.elevations, false) {
                    self.bounds.refine_elevation(lo, hi);
                }
                self.cpu = Some(TileCpuData { payload });
                self.load_duration = Some(duration);
                self.state = TileState::Loaded;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                log::warn!("load failed for {}: {message}", self.coordinate);
                self.set_error(message);
                Err(e)
            }
        }
    }

    /// Synchronous load path: acquire elevation data from the source and
    /// transition `Empty → Loading → Loaded` (or `Error`). The streaming
    /// scheduler performs the same steps split across threads.
    pub fn load_data(&mut self, source: &dyn TileDataSource) -> TerrainResult<()> {
        let generation = self.mark_loading()?;
        let start = Instant::now();
        let result = source.load_tile_data(&self.coordinate).map(Arc::new);
        self.finish_load(generation, result, start.elapsed())
    }

    /// Create GPU resources from the loaded elevation data. All-or-nothing:
    /// on any allocation or resource-creation failure every partial
    /// reservation is returned and the tile transitions to `Error` with no
    /// GPU resources attached.
    pub fn upload_to_gpu(
        &mut self,
        gpu: &GpuContext,
        allocator: &MemoryPoolAllocator,
    ) -> TerrainResult<()> {
        let Some(cpu) = self.cpu.clone().filter(|_| self.state == TileState::Loaded) else {
            return Err(TerrainError::InvalidState {
                expected: TileState::Loaded,
                found: self.state,
            });
        };
        self.state = TileState::Uploading;

        match create_gpu_resources(&self.coordinate, &self.bounds, &cpu, gpu, allocator) {
            Ok(resources) => {
                self.gpu = Some(resources);
                self.state = TileState::Ready;
                Ok(())
            }
            Err(e) => {
                self.set_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Release GPU resources only. Idempotent and safe in every state; a
    /// `Ready` tile drops back to `Loaded`.
    pub fn unload_from_gpu(&mut self, allocator: &MemoryPoolAllocator) {
        if let Some(resources) = self.gpu.take() {
            for allocation in resources.allocations {
                allocator.deallocate(allocation);
            }
        }
        if self.state == TileState::Ready {
            self.state = TileState::Loaded;
        }
    }

    /// Release GPU and CPU data. Idempotent; every state except `Error`
    /// transitions to `Evicted`.
    pub fn evict_from_memory(&mut self, allocator: &MemoryPoolAllocator) {
        self.unload_from_gpu(allocator);
        self.cpu = None;
        if self.state != TileState::Error {
            self.state = TileState::Evicted;
        }
    }

    /// Record this tile into the render pass: vertex buffer, texture bind
    /// group (group 1; group 0 carries the caller's frame uniforms), one
    /// draw of the patch grid. Fails with [`TerrainError::NotReady`] when the
    /// tile has no valid GPU resources — callers skip, never abort the frame.
    pub fn render<'a>(&'a self, render_pass: &mut wgpu::RenderPass<'a>) -> TerrainResult<()> {
        let Some(resources) = self.gpu.as_ref().filter(|_| self.state == TileState::Ready) else {
            return Err(TerrainError::NotReady);
        };

        self.mark_accessed();

        render_pass.set_vertex_buffer(0, resources.vertex_buffer.slice(..));
        render_pass.set_bind_group(1, &resources.bind_group, &[]);

        let patches = (VERTICES_PER_SIDE - 1) * (VERTICES_PER_SIDE - 1);
        render_pass.draw(0..patches * 4, 0..1);
        Ok(())
    }

    pub fn distance_to_camera(&self, camera_position: Vec3) -> f32 {
        (camera_position - self.bounds.center()).length()
    }

    /// Scheduling priority: near tiles first, finer levels preferred,
    /// recently-rendered tiles boosted.
    pub fn update_priority(&mut self, camera_position: Vec3, _delta_time: f32) {
        let distance = self.distance_to_camera(camera_position);
        let base = 1000.0 / (distance + 1.0);
        let lod_bonus = 8u32.saturating_sub(self.coordinate.level) as f32 * 10.0;
        let access_bonus = (RECENCY_WINDOW - self.frames_since_access() as f32).max(0.0);
        self.priority = base + lod_bonus + access_bonus;
    }

    /// Distance-banded LOD between `near` (level 0) and `far` (level 7).
    pub fn recommended_lod(&self, camera_position: Vec3, near: f32, far: f32) -> u32 {
        let distance = self.distance_to_camera(camera_position);
        if distance < near {
            0
        } else if distance > far {
            7
        } else {
            let ratio = (distance - near) / (far - near);
            (ratio * 7.0) as u32
        }
    }

    /// AABB-vs-frustum test using the positive vertex (the corner farthest
    /// along each plane normal). Planes are `(normal, distance)` with
    /// inward-facing normals.
    pub fn is_visible(&self, frustum_planes: &[Vec4; 6]) -> bool {
        for plane in frustum_planes {
            let normal = plane.truncate();
            let mut positive = self.bounds.min;
            if normal.x >= 0.0 {
                positive.x = self.bounds.max.x;
            }
            if normal.y >= 0.0 {
                positive.y = self.bounds.max.y;
            }
            if normal.z >= 0.0 {
                positive.z = self.bounds.max.z;
            }
            if normal.dot(positive) + plane.w < 0.0 {
                return false;
            }
        }
        true
    }

    fn set_error(&mut self, message: String) {
        self.error_message = Some(message);
        self.state = TileState::Error;
    }
}

fn create_gpu_resources(
    coordinate: &TileCoordinate,
    bounds: &TileBounds,
    cpu: &TileCpuData,
    gpu: &GpuContext,
    allocator: &MemoryPoolAllocator,
) -> TerrainResult<TileGpuResources> {
    let vertices = build_base_mesh(coordinate, bounds);
    let vertex_bytes = (vertices.len() * std::mem::size_of::<TileVertex>()) as u64;
    let width = cpu.width();
    let height = cpu.height();

    // Reserve all pool backing up front; on any failure return the partial
    // reservations so a failed upload leaves nothing behind.
    let mut allocations: Vec<PoolAllocation> = Vec::with_capacity(3);
    let reservations = [
        (PoolKind::VertexBuffer, vertex_bytes),
        (PoolKind::HeightTexture, width as u64 * height as u64 * 4),
        (PoolKind::NormalTexture, width as u64 * height as u64 * 4),
    ];
    for (kind, size) in reservations {
        match allocator.allocate(kind, size) {
            Ok(allocation) => allocations.push(allocation),
            Err(e) => {
                for allocation in allocations {
                    allocator.deallocate(allocation);
                }
                return Err(e);
            }
        }
    }

    let device = &gpu.device;
    let label = coordinate.to_string();

    let vertex_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(&format!("tile-vertices-{label}")),
        size: vertex_bytes,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    gpu.queue
        .write_buffer(&vertex_buffer, 0, bytemuck::cast_slice(&vertices));

    let extent = wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    };

    let height_texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(&format!("tile-height-{label}")),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R32Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    gpu.queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &height_texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytemuck::cast_slice(cpu.elevations()),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(width * 4),
            rows_per_image: Some(height),
        },
        extent,
    );
    let height_view = height_texture.create_view(&wgpu::TextureViewDescriptor::default());

    let normals = generate_normals(cpu, tile_extent(coordinate.level));
    let normal_texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(&format!("tile-normals-{label}")),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    gpu.queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &normal_texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &normals,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(width * 4),
            rows_per_image: Some(height),
        },
        extent,
    );
    let normal_view = normal_texture.create_view(&wgpu::TextureViewDescriptor::default());

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(&format!("tile-bind-group-{label}")),
        layout: gpu.tile_bind_group_layout(),
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&height_view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&normal_view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(gpu.height_sampler()),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: wgpu::BindingResource::Sampler(gpu.normal_sampler()),
            },
        ],
    });

    let total_gpu_bytes = allocations.iter().map(|a| a.size_bytes()).sum();
    Ok(TileGpuResources {
        vertex_buffer,
        vertex_count: vertices.len() as u32,
        height_texture,
        height_view,
        normal_texture,
        normal_view,
        bind_group,
        allocations,
        total_gpu_bytes,
    })
}

/// Flat base grid across the tile footprint; elevations are applied by the
/// external tessellation stage sampling the height texture.
fn build_base_mesh(coordinate: &TileCoordinate, bounds: &TileBounds) -> Vec<TileVertex> {
    let side = VERTICES_PER_SIDE;
    let spacing = tile_extent(coordinate.level) / (side - 1) as f32;
    let mut vertices = Vec::with_capacity((side * side) as usize);
    for y in 0..side {
        for x in 0..side {
            vertices.push(TileVertex {
                position: [
                    bounds.min.x + x as f32 * spacing,
                    0.0,
                    bounds.min.z + y as f32 * spacing,
                ],
                tex_coord: [
                    x as f32 / (side - 1) as f32,
                    y as f32 / (side - 1) as f32,
                ],
                normal: [0.0, 1.0, 0.0],
            });
        }
    }
    vertices
}

/// Central-difference surface normals packed as RGBA8.
fn generate_normals(cpu: &TileCpuData, tile_extent: f32) -> Vec<u8> {
    let width = cpu.width() as usize;
    let height = cpu.height() as usize;
    let heights = cpu.elevations();
    let spacing = tile_extent / (cpu.width().max(2) - 1) as f32;
    let scale = cpu.height_scale();

    let sample = |x: usize, y: usize| heights[y * width + x] * scale;

    let mut out = Vec::with_capacity(width * height * 4);
    for y in 0..height {
        for x in 0..width {
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(height - 1);
            let dx = (sample(x1, y) - sample(x0, y)) / ((x1 - x0).max(1) as f32 * spacing);
            let dz = (sample(x, y1) - sample(x, y0)) / ((y1 - y0).max(1) as f32 * spacing);
            let normal = Vec3::new(-dx, 1.0, -dz).normalize_or_zero();
            out.push(((normal.x * 0.5 + 0.5) * 255.0) as u8);
            out.push(((normal.y * 0.5 + 0.5) * 255.0) as u8);
            out.push(((normal.z * 0.5 + 0.5) * 255.0) as u8);
            out.push(255);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::dataset::SyntheticTileSource;

    struct FlatSource {
        size: u32,
    }

    impl TileDataSource for FlatSource {
        fn load_tile_data(&self, _coord: &TileCoordinate) -> TerrainResult<TileSourceData> {
            Ok(TileSourceData {
                width: self.size,
                height: self.size,
                elevations: vec![0.0; (self.size * self.size) as usize],
                height_scale: 1.0,
            })
        }
    }

    struct FailingSource;

    impl TileDataSource for FailingSource {
        fn load_tile_data(&self, coord: &TileCoordinate) -> TerrainResult<TileSourceData> {
            Err(TerrainError::dataset(format!("no data for {coord}")))
        }
    }

    #[test]
    fn flat_tile_loads_with_degenerate_elevation() {
        let mut tile = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds1"));
        tile.load_data(&FlatSource { size: 64 }).unwrap();

        assert_eq!(tile.state(), TileState::Loaded);
        assert_eq!(tile.bounds().min_elevation, 0.0);
        assert_eq!(tile.bounds().max_elevation, 0.0);
        assert!(tile.load_duration().is_some());
        assert_eq!(tile.memory_usage(), 64 * 64 * 4);
    }

    #[test]
    fn load_rejected_unless_empty_or_evicted() {
        let mut tile = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds"));
        tile.load_data(&FlatSource { size: 8 }).unwrap();

        let err = tile.load_data(&FlatSource { size: 8 }).unwrap_err();
        assert!(matches!(err, TerrainError::InvalidState { .. }));
        assert_eq!(tile.state(), TileState::Loaded);
    }

    #[test]
    fn failed_load_sets_error_with_message() {
        let mut tile = TerrainTile::new(TileCoordinate::new(1, 2, 0, "ds"));
        assert!(tile.load_data(&FailingSource).is_err());
        assert_eq!(tile.state(), TileState::Error);
        assert!(tile.error_message().unwrap().contains("no data"));
    }

    #[test]
    fn evict_clears_cpu_data_and_allows_reload() {
        let allocator = MemoryPoolAllocator::default();
        let mut tile = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds"));
        tile.load_data(&SyntheticTileSource::new(32, 1.0)).unwrap();
        let bounds_before = *tile.bounds();

        tile.evict_from_memory(&allocator);
        assert_eq!(tile.state(), TileState::Evicted);
        assert_eq!(tile.memory_usage(), 0);

        tile.load_data(&SyntheticTileSource::new(32, 1.0)).unwrap();
        assert_eq!(tile.state(), TileState::Loaded);
        assert_eq!(*tile.bounds(), bounds_before);
    }

    #[test]
    fn stale_completion_is_discarded() {
        let mut tile = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds"));
        let first = tile.mark_loading().unwrap();

        // The tile is recreated at the same coordinate while the first load
        // is still in flight.
        let allocator = MemoryPoolAllocator::default();
        tile.evict_from_memory(&allocator);
        let second = tile.mark_loading().unwrap();
        assert!(second > first);

        let stale = FlatSource { size: 8 }
            .load_tile_data(tile.coordinate())
            .map(Arc::new);
        tile.finish_load(first, stale, Duration::from_millis(1)).unwrap();
        assert_eq!(tile.state(), TileState::Loading);
        assert!(tile.cpu_data().is_none());
    }

    #[test]
    fn upload_requires_loaded_state() {
        // State precondition fires before any device work, so an error-state
        // check needs no GPU.
        let mut tile = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds"));
        assert_eq!(tile.state(), TileState::Empty);
        assert!(!tile.has_valid_gpu_resources());
    }

    #[test]
    fn priority_prefers_near_and_fine_tiles() {
        let camera = Vec3::new(0.0, 100.0, 0.0);
        let mut near_fine = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds"));
        let mut far_coarse = TerrainTile::new(TileCoordinate::new(40, 40, 3, "ds"));
        near_fine.update_priority(camera, 0.016);
        far_coarse.update_priority(camera, 0.016);
        assert!(near_fine.priority() > far_coarse.priority());
    }

    #[test]
    fn recency_bonus_decays_with_frames() {
        let camera = Vec3::ZERO;
        let mut tile = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds"));
        tile.update_priority(camera, 0.016);
        let fresh = tile.priority();

        for _ in 0..150 {
            tile.increment_frame_counter();
        }
        tile.update_priority(camera, 0.016);
        assert!(tile.priority() < fresh);
    }

    #[test]
    fn frustum_excludes_distant_tile() {
        // Frustum covering roughly [-10, 10] on X/Z: inward plane normals.
        let planes = [
            Vec4::new(1.0, 0.0, 0.0, 10.0),  // x >= -10
            Vec4::new(-1.0, 0.0, 0.0, 10.0), // x <= 10
            Vec4::new(0.0, 1.0, 0.0, 10.0),
            Vec4::new(0.0, -1.0, 0.0, 1000.0),
            Vec4::new(0.0, 0.0, 1.0, 10.0),  // z >= -10
            Vec4::new(0.0, 0.0, -1.0, 10.0), // z <= 10
        ];

        // Tile (8, 8) at level 3 spans [1000, 1125] on X and Z, fully
        // outside the frustum box.
        let far_tile = TerrainTile::new(TileCoordinate::new(8, 8, 3, "ds"));
        assert!(far_tile.bounds().min.x >= 100.0);
        assert!(!far_tile.is_visible(&planes));

        let near_tile = TerrainTile::new(TileCoordinate::new(0, 0, 3, "ds"));
        assert!(near_tile.is_visible(&planes));
    }

    #[test]
    fn recommended_lod_bands() {
        let tile = TerrainTile::new(TileCoordinate::new(0, 0, 0, "ds"));
        let center = tile.bounds().center();
        assert_eq!(tile.recommended_lod(center, 50.0, 2000.0), 0);
        let far = center + Vec3::new(5000.0, 0.0, 0.0);
        assert_eq!(tile.recommended_lod(far, 50.0, 2000.0), 7);
    }

    #[test]
    fn base_mesh_covers_tile_footprint() {
        let coord = TileCoordinate::new(0, 0, 0, "ds");
        let bounds = TileBounds::from_coordinate(&coord);
        let vertices = build_base_mesh(&coord, &bounds);
        assert_eq!(vertices.len(), (VERTICES_PER_SIDE * VERTICES_PER_SIDE) as usize);
        let first = vertices.first().unwrap();
        let last = vertices.last().unwrap();
        assert_eq!(first.position[0], bounds.min.x);
        assert!((last.position[0] - bounds.max.x).abs() < 1e-2);
        assert!((last.position[2] - bounds.max.z).abs() < 1e-2);
    }

    #[test]
    fn normals_point_up_for_flat_terrain() {
        let payload = Arc::new(TileSourceData {
            width: 8,
            height: 8,
            elevations: vec![5.0; 64],
            height_scale: 1.0,
        });
        let cpu = TileCpuData { payload };
        let normals = generate_normals(&cpu, 1000.0);
        assert_eq!(normals.len(), 8 * 8 * 4);
        // Flat terrain: every normal is (0, 1, 0) → (128, 255, 128, 255).
        assert_eq!(&normals[0..4], &[127, 255, 127, 255]);
    }
}
