//! Core engine modules
//!
//! Engine-generic services underneath the terrain subsystem.

pub mod memory_pool;
