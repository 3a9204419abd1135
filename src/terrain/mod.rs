//! Terrain streaming subsystem: tile addressing, lifecycle, registry,
//! visibility culling and the background streaming scheduler.

pub mod bounds;
pub mod config;
pub mod coordinate;
pub mod culling;
pub mod dataset;
pub mod manager;
pub mod stats;
pub mod streaming;
pub mod tile;

pub use bounds::{tile_extent, TileBounds};
pub use config::TerrainConfig;
pub use coordinate::TileCoordinate;
pub use culling::{
    banded_lod, lod_for_distance, CullQuadtree, CullQuadtreeConfig, CullResults, CullingConfig,
    CullingObject, CullingParams, Frustum, VisibilityCuller,
};
pub use dataset::{SyntheticTileSource, TileDataCache, TileDataSource, TileSourceData};
pub use manager::{TerrainTileManager, TileManagerConfig, TileManagerStats};
pub use streaming::{LoadCompletion, LoadRequest, StreamingConfig, StreamingScheduler};
pub use tile::{TerrainTile, TileGpuResources, TileState, TileVertex};
