//! Shared types for the typed terrain memory pools.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Resource categories served by dedicated pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Vertex data for terrain base meshes
    VertexBuffer,
    /// Index data for terrain base meshes
    IndexBuffer,
    /// Height map textures
    HeightTexture,
    /// Color/albedo textures
    ColorTexture,
    /// Normal map textures
    NormalTexture,
    /// Uniform/constant buffers
    UniformBuffer,
    /// Temporary staging buffers
    StagingBuffer,
    /// Compute shader buffers
    ComputeBuffer,
}

impl PoolKind {
    pub const ALL: [PoolKind; 8] = [
        PoolKind::VertexBuffer,
        PoolKind::IndexBuffer,
        PoolKind::HeightTexture,
        PoolKind::ColorTexture,
        PoolKind::NormalTexture,
        PoolKind::UniformBuffer,
        PoolKind::StagingBuffer,
        PoolKind::ComputeBuffer,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub(crate) fn index(self) -> usize {
        match self {
            PoolKind::VertexBuffer => 0,
            PoolKind::IndexBuffer => 1,
            PoolKind::HeightTexture => 2,
            PoolKind::ColorTexture => 3,
            PoolKind::NormalTexture => 4,
            PoolKind::UniformBuffer => 5,
            PoolKind::StagingBuffer => 6,
            PoolKind::ComputeBuffer => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolKind::VertexBuffer => "VertexBuffer",
            PoolKind::IndexBuffer => "IndexBuffer",
            PoolKind::HeightTexture => "HeightTexture",
            PoolKind::ColorTexture => "ColorTexture",
            PoolKind::NormalTexture => "NormalTexture",
            PoolKind::UniformBuffer => "UniformBuffer",
            PoolKind::StagingBuffer => "StagingBuffer",
            PoolKind::ComputeBuffer => "ComputeBuffer",
        }
    }

    /// Texture kinds carry image data; the rest carry linear buffer data.
    pub fn is_texture(self) -> bool {
        matches!(
            self,
            PoolKind::HeightTexture | PoolKind::ColorTexture | PoolKind::NormalTexture
        )
    }
}

/// Per-kind pool configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    pub preferred_pool_size: u64,
    pub min_pool_size: u64,
    pub allocation_alignment: u64,
    pub enable_defragmentation: bool,
    pub growth_factor: f32,
}

const MIB: u64 = 1024 * 1024;

impl PoolConfig {
    /// Defaults tuned per resource category. Texture pools hold large,
    /// rarely-reallocated resources and therefore skip defragmentation.
    pub fn default_for(kind: PoolKind) -> Self {
        match kind {
            PoolKind::VertexBuffer => Self {
                preferred_pool_size: 128 * MIB,
                min_pool_size: 16 * MIB,
                allocation_alignment: 256,
                enable_defragmentation: true,
                growth_factor: 1.5,
            },
            PoolKind::IndexBuffer => Self {
                preferred_pool_size: 64 * MIB,
                min_pool_size: 8 * MIB,
                allocation_alignment: 256,
                enable_defragmentation: true,
                growth_factor: 1.5,
            },
            PoolKind::HeightTexture => Self {
                preferred_pool_size: 256 * MIB,
                min_pool_size: 32 * MIB,
                allocation_alignment: 1024,
                enable_defragmentation: false,
                growth_factor: 2.0,
            },
            PoolKind::ColorTexture => Self {
                preferred_pool_size: 512 * MIB,
                min_pool_size: 64 * MIB,
                allocation_alignment: 1024,
                enable_defragmentation: false,
                growth_factor: 2.0,
            },
            PoolKind::NormalTexture => Self {
                preferred_pool_size: 256 * MIB,
                min_pool_size: 32 * MIB,
                allocation_alignment: 1024,
                enable_defragmentation: false,
                growth_factor: 2.0,
            },
            PoolKind::UniformBuffer => Self {
                preferred_pool_size: 16 * MIB,
                min_pool_size: 2 * MIB,
                allocation_alignment: 256,
                enable_defragmentation: true,
                growth_factor: 1.5,
            },
            PoolKind::StagingBuffer => Self {
                preferred_pool_size: 64 * MIB,
                min_pool_size: 8 * MIB,
                allocation_alignment: 64,
                enable_defragmentation: true,
                growth_factor: 1.5,
            },
            PoolKind::ComputeBuffer => Self {
                preferred_pool_size: 32 * MIB,
                min_pool_size: 4 * MIB,
                allocation_alignment: 256,
                enable_defragmentation: true,
                growth_factor: 1.5,
            },
        }
    }
}

/// Allocator-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_total_memory: u64,
    /// Advisory threshold; crossing it notifies the registered callback.
    pub warning_threshold: f32,
    /// Crossing this additionally triggers forced pressure handling.
    pub critical_threshold: f32,
    pub enable_auto_defragmentation: bool,
    /// Fragmentation ratio above which the maintenance pass bothers defragging.
    pub defragmentation_threshold: f32,
    /// Wall-clock budget for a routine defragmentation pass.
    pub max_defragmentation_time_ms: u64,
    pub pool_configs: HashMap<PoolKind, PoolConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let pool_configs = PoolKind::ALL
            .iter()
            .map(|&kind| (kind, PoolConfig::default_for(kind)))
            .collect();
        Self {
            max_total_memory: 2 * 1024 * MIB,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            enable_auto_defragmentation: true,
            defragmentation_threshold: 0.3,
            max_defragmentation_time_ms: 16,
            pool_configs,
        }
    }
}

impl MemoryConfig {
    pub fn pool_config(&self, kind: PoolKind) -> PoolConfig {
        self.pool_configs
            .get(&kind)
            .copied()
            .unwrap_or_else(|| PoolConfig::default_for(kind))
    }
}

/// Handle to one live allocation inside a typed pool.
///
/// Move-only by construction: releasing goes through
/// [`MemoryPoolAllocator::deallocate`](super::MemoryPoolAllocator::deallocate),
/// which consumes the handle, so a double release does not typecheck.
#[derive(Debug)]
pub struct PoolAllocation {
    pub(crate) kind: PoolKind,
    pub(crate) size_bytes: u64,
    pub(crate) alignment: u64,
    pub(crate) offset: u64,
    pub(crate) id: u64,
    pub(crate) allocated_at: Instant,
}

impl PoolAllocation {
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Aligned size actually reserved in the pool.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Byte offset of this allocation within its pool's address range.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> std::time::Duration {
        self.allocated_at.elapsed()
    }
}

/// Aggregate allocator statistics.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub total_allocated: u64,
    pub total_used: u64,
    pub total_free: u64,
    pub active_allocations: u32,
    pub pool_count: u32,
    pub allocated_by_kind: HashMap<PoolKind, u64>,
    pub used_by_kind: HashMap<PoolKind, u64>,
    pub count_by_kind: HashMap<PoolKind, u32>,
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub failed_allocations: u64,
    /// 0.0 = no fragmentation, 1.0 = highly fragmented (average across pools).
    pub fragmentation: f32,
}

/// Result of one defragmentation pass.
#[derive(Debug, Clone, Default)]
pub struct DefragStats {
    pub pools_visited: u32,
    pub blocks_merged: u32,
    pub fragmentation_before: f32,
    pub fragmentation_after: f32,
    pub duration_ms: f64,
}

/// Outcome of a bounded defragmentation pass. `Timeout` is non-fatal: the
/// pass resumes from its cursor on the next invocation.
#[derive(Debug, Clone)]
pub enum DefragStatus {
    Completed(DefragStats),
    Timeout(DefragStats),
}

impl DefragStatus {
    pub fn stats(&self) -> &DefragStats {
        match self {
            DefragStatus::Completed(s) | DefragStatus::Timeout(s) => s,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, DefragStatus::Timeout(_))
    }
}

/// Round `size` up to a multiple of `alignment` (power of two).
pub fn align_size(size: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (size + alignment - 1) & !(alignment - 1)
}

pub fn is_aligned(offset: u64, alignment: u64) -> bool {
    (offset & (alignment - 1)) == 0
}

/// Human-readable byte count, e.g. `1.50 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_size_rounds_up() {
        assert_eq!(align_size(1, 256), 256);
        assert_eq!(align_size(256, 256), 256);
        assert_eq!(align_size(257, 256), 512);
        assert!(is_aligned(512, 256));
        assert!(!is_aligned(300, 256));
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn texture_pools_skip_defragmentation() {
        for kind in PoolKind::ALL {
            let config = PoolConfig::default_for(kind);
            assert_eq!(config.enable_defragmentation, !kind.is_texture());
        }
    }

    #[test]
    fn default_config_covers_every_kind() {
        let config = MemoryConfig::default();
        assert_eq!(config.pool_configs.len(), PoolKind::COUNT);
    }
}
