//! Top-level configuration surface for the terrain streaming engine.

use crate::core::memory_pool::MemoryConfig;
use crate::error::{TerrainError, TerrainResult};
use crate::terrain::culling::{CullingConfig, CullingParams};
use crate::terrain::manager::TileManagerConfig;
use crate::terrain::streaming::StreamingConfig;
use serde::{Deserialize, Serialize};

/// All recognized options in one place. Every field has a sensible default,
/// so partial JSON configs work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    pub manager: TileManagerConfig,
    pub memory: MemoryConfig,
    pub streaming: StreamingConfig,

    /// Distance of full-detail terrain (LOD band scaling starts here).
    pub near_distance: f32,
    /// Maximum streaming/render distance.
    pub far_distance: f32,
    /// Distance-band thresholds for LOD selection.
    pub lod_distances: [f32; 4],

    pub enable_frustum_culling: bool,
    pub enable_lod_culling: bool,
    pub enable_gpu_culling: bool,

    /// Residency candidates retained per frame after distance sorting.
    pub max_visible_tiles: usize,
    /// GPU uploads applied per frame when integrating completions.
    pub max_uploads_per_frame: usize,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            manager: TileManagerConfig::default(),
            memory: MemoryConfig::default(),
            streaming: StreamingConfig::default(),
            near_distance: 50.0,
            far_distance: 2000.0,
            lod_distances: [500.0, 1000.0, 2500.0, 5000.0],
            enable_frustum_culling: true,
            enable_lod_culling: false,
            enable_gpu_culling: true,
            max_visible_tiles: 256,
            max_uploads_per_frame: 8,
        }
    }
}

impl TerrainConfig {
    pub fn from_json_str(json: &str) -> TerrainResult<Self> {
        serde_json::from_str(json).map_err(|e| TerrainError::Config(e.to_string()))
    }

    pub fn to_json_string(&self) -> TerrainResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| TerrainError::Config(e.to_string()))
    }

    /// Culler settings derived from the flat option surface.
    pub fn culling_config(&self) -> CullingConfig {
        CullingConfig {
            params: CullingParams {
                lod_distances: self.lod_distances,
                enable_frustum_culling: self.enable_frustum_culling,
                enable_lod_culling: self.enable_lod_culling,
            },
            enable_gpu_culling: self.enable_gpu_culling,
            ..CullingConfig::default()
        }
    }
}
