//! Free-list sub-allocator backing one resource category.

use super::types::{align_size, PoolConfig, PoolKind};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    offset: u64,
    size: u64,
}

/// A single typed pool: a budgeted address range carved into blocks by a
/// first-fit free list. Offsets stay aligned because every reserved size is
/// a multiple of the pool alignment and the range starts at zero.
pub(crate) struct TypedPool {
    kind: PoolKind,
    config: PoolConfig,
    total_size: u64,
    used_size: u64,
    /// Free blocks as (offset, size), sorted by offset.
    free_blocks: Vec<(u64, u64)>,
    live: HashMap<u64, LiveBlock>,
}

impl TypedPool {
    pub(crate) fn new(kind: PoolKind, config: PoolConfig) -> Self {
        let total_size = config.preferred_pool_size;
        Self {
            kind,
            config,
            total_size,
            used_size: 0,
            free_blocks: vec![(0, total_size)],
            live: HashMap::new(),
        }
    }

    pub(crate) fn kind(&self) -> PoolKind {
        self.kind
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total_size
    }

    pub(crate) fn used_size(&self) -> u64 {
        self.used_size
    }

    pub(crate) fn free_size(&self) -> u64 {
        self.total_size - self.used_size
    }

    pub(crate) fn active_allocations(&self) -> u32 {
        self.live.len() as u32
    }

    pub(crate) fn aligned_size(&self, size: u64) -> u64 {
        align_size(size, self.config.allocation_alignment)
    }

    pub(crate) fn can_allocate(&self, aligned_size: u64) -> bool {
        self.used_size + aligned_size <= self.total_size
            && self
                .free_blocks
                .iter()
                .any(|&(_, block_size)| block_size >= aligned_size)
    }

    /// Reserve `aligned_size` bytes under `id`. Returns the block offset, or
    /// `None` when no free block fits.
    pub(crate) fn allocate(&mut self, id: u64, aligned_size: u64) -> Option<u64> {
        let slot = self
            .free_blocks
            .iter()
            .position(|&(_, size)| size >= aligned_size)?;

        let (offset, size) = self.free_blocks.remove(slot);
        if size > aligned_size {
            self.free_blocks.push((offset + aligned_size, size - aligned_size));
            self.free_blocks.sort_by_key(|&(o, _)| o);
        }

        self.used_size += aligned_size;
        self.live.insert(
            id,
            LiveBlock {
                offset,
                size: aligned_size,
            },
        );
        Some(offset)
    }

    /// Release the block reserved under `id`. Returns the freed size, or
    /// `None` when the id is unknown (caller contract violation — the pool's
    /// accounting is left untouched).
    pub(crate) fn free(&mut self, id: u64) -> Option<u64> {
        let block = self.live.remove(&id)?;
        self.used_size -= block.size;
        self.free_blocks.push((block.offset, block.size));
        self.free_blocks.sort_by_key(|&(o, _)| o);
        self.merge_free_blocks();
        Some(block.size)
    }

    /// Grow the pool to `new_total`, appending the new range to the free
    /// list. Shrinking below the used size or the configured minimum is
    /// rejected.
    pub(crate) fn resize(&mut self, new_total: u64) -> bool {
        if new_total < self.used_size || new_total < self.config.min_pool_size {
            return false;
        }
        if new_total > self.total_size {
            self.free_blocks.push((self.total_size, new_total - self.total_size));
            self.free_blocks.sort_by_key(|&(o, _)| o);
            self.merge_free_blocks();
        } else if new_total < self.total_size {
            // Shrink only when the tail of the range is entirely free.
            let tail = self.total_size - new_total;
            match self.free_blocks.last().copied() {
                Some((offset, size)) if offset + size == self.total_size && size >= tail => {
                    let last = self.free_blocks.last_mut().unwrap();
                    last.1 -= tail;
                    if last.1 == 0 {
                        self.free_blocks.pop();
                    }
                }
                _ => return false,
            }
        }
        self.total_size = new_total;
        true
    }

    /// Coalesce adjacent free blocks; returns how many merges happened.
    pub(crate) fn merge_free_blocks(&mut self) -> u32 {
        if self.free_blocks.is_empty() {
            return 0;
        }

        let before = self.free_blocks.len();
        let mut merged = Vec::with_capacity(before);
        let mut current = self.free_blocks[0];

        for &(offset, size) in &self.free_blocks[1..] {
            if current.0 + current.1 == offset {
                current.1 += size;
            } else {
                merged.push(current);
                current = (offset, size);
            }
        }
        merged.push(current);

        let merges = (before - merged.len()) as u32;
        self.free_blocks = merged;
        merges
    }

    /// `1 - largest_free / total_free`; zero when the pool is empty or has a
    /// single contiguous free block.
    pub(crate) fn fragmentation(&self) -> f32 {
        let total_free: u64 = self.free_blocks.iter().map(|&(_, s)| s).sum();
        if total_free == 0 {
            return 0.0;
        }
        let largest_free = self.free_blocks.iter().map(|&(_, s)| s).max().unwrap_or(0);
        1.0 - largest_free as f32 / total_free as f32
    }
}
