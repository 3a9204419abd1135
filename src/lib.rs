//! terrastream — tiled height-field streaming for real-time terrain
//! rendering.
//!
//! Streams a large, tiled geospatial elevation dataset into GPU-resident,
//! tessellation-ready form. Rust: wgpu 0.19.
//!
//! The crate decides *which* tiles exist in GPU memory, *when*, and *how
//! much* memory they may consume; the rendering pipeline, camera math and
//! raster decoding live with the caller:
//!
//! - [`terrain::TerrainTileManager`] — coordinate→tile registry with LRU
//!   eviction and a priority loading queue.
//! - [`terrain::TerrainTile`] — per-tile lifecycle
//!   (`Empty → Loading → Loaded → Uploading → Ready`) with pool-backed GPU
//!   resources.
//! - [`core::memory_pool::MemoryPoolAllocator`] — budgeted typed pools with
//!   pressure detection and bounded defragmentation.
//! - [`terrain::VisibilityCuller`] — frustum + LOD-band culling with a
//!   compute path that falls back to the CPU transparently.
//! - [`terrain::StreamingScheduler`] — background load workers feeding the
//!   manager through bounded channels, so the render thread never blocks
//!   on I/O.

pub mod core;
pub mod error;
pub mod gpu;
pub mod terrain;

pub use error::{TerrainError, TerrainResult};
pub use gpu::GpuContext;
