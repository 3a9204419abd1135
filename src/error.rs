//! Central error handling for the terrain streaming engine.
//!
//! Provides a unified TerrainError enum with consistent categorization
//! across the tile lifecycle, memory pools and culling paths.

use crate::core::memory_pool::PoolKind;
use crate::terrain::tile::TileState;

/// Centralized error type for all terrain streaming operations.
#[derive(thiserror::Error, Debug)]
pub enum TerrainError {
    #[error("invalid tile state: expected {expected:?}, found {found:?}")]
    InvalidState { expected: TileState, found: TileState },

    #[error("tile is not ready for rendering")]
    NotReady,

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("allocation of {requested} bytes from {kind:?} pool failed: {reason}")]
    Allocation {
        kind: PoolKind,
        requested: u64,
        reason: String,
    },

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("readback error: {0}")]
    Readback(String),

    #[error("loading queue is full")]
    QueueFull,

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TerrainError {
    /// Convenience constructors for common error categories.
    pub fn dataset<T: ToString>(msg: T) -> Self {
        TerrainError::Dataset(msg.to_string())
    }

    pub fn gpu<T: ToString>(msg: T) -> Self {
        TerrainError::Gpu(msg.to_string())
    }

    pub fn readback<T: ToString>(msg: T) -> Self {
        TerrainError::Readback(msg.to_string())
    }

    pub fn allocation<T: ToString>(kind: PoolKind, requested: u64, reason: T) -> Self {
        TerrainError::Allocation {
            kind,
            requested,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for terrain streaming operations.
pub type TerrainResult<T> = Result<T, TerrainError>;
