//! Typed memory pools for terrain resources.
//!
//! One budgeted sub-allocator per resource category (vertex data, index
//! data, height/color/normal textures, uniform, staging and compute
//! buffers), created lazily on first use. The allocator tracks a global
//! usage ratio against `max_total_memory` and reacts to pressure: crossing
//! the warning threshold notifies a registered callback, crossing the
//! critical threshold additionally forces a bounded defragmentation pass.
//!
//! The allocator is an explicit instance shared by reference (or `Arc`)
//! between the render thread and the streaming maintenance thread. Each pool
//! has its own lock; aggregate statistics live behind a separate lock so
//! stat reads never serialize the pools.

mod pool;
mod types;

pub use types::{
    align_size, format_bytes, is_aligned, DefragStats, DefragStatus, MemoryConfig, MemoryStats,
    PoolAllocation, PoolConfig, PoolKind,
};

use crate::error::{TerrainError, TerrainResult};
use pool::TypedPool;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Notified with the current usage ratio when a pressure threshold is crossed.
pub type MemoryPressureCallback = Box<dyn Fn(f32) + Send + Sync>;

pub struct MemoryPoolAllocator {
    config: MemoryConfig,
    pools: [Mutex<Option<TypedPool>>; PoolKind::COUNT],
    stats: Mutex<MemoryStats>,

    // Global byte counters, kept lock-free so the hot path and ratio reads
    // never contend on the stats lock.
    total_used: AtomicU64,
    total_pool_bytes: AtomicU64,

    next_allocation_id: AtomicU64,
    allocation_count: AtomicU64,
    deallocation_count: AtomicU64,
    failed_count: AtomicU64,

    pressure_callback: Mutex<Option<MemoryPressureCallback>>,
    warning_latched: AtomicBool,
    critical_latched: AtomicBool,

    // Defragmentation resume cursor and maintenance pacing.
    defrag_cursor: AtomicUsize,
    last_defrag: Mutex<Instant>,
}

impl Default for MemoryPoolAllocator {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryPoolAllocator {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            pools: std::array::from_fn(|_| Mutex::new(None)),
            stats: Mutex::new(MemoryStats::default()),
            total_used: AtomicU64::new(0),
            total_pool_bytes: AtomicU64::new(0),
            next_allocation_id: AtomicU64::new(1),
            allocation_count: AtomicU64::new(0),
            deallocation_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            pressure_callback: Mutex::new(None),
            warning_latched: AtomicBool::new(false),
            critical_latched: AtomicBool::new(false),
            defrag_cursor: AtomicUsize::new(0),
            last_defrag: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Allocate `size` bytes from the pool for `kind`.
    ///
    /// The pool is created lazily at its preferred size. When the request
    /// does not fit, one growth step (`growth_factor`, bounded below by
    /// `min_pool_size`, bounded above by the global budget) is attempted
    /// before the request is rejected with [`TerrainError::Allocation`].
    pub fn allocate(&self, kind: PoolKind, size: u64) -> TerrainResult<PoolAllocation> {
        if size == 0 {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
            return Err(TerrainError::allocation(kind, size, "zero-size request"));
        }

        let result = {
            let mut slot = self.pools[kind.index()].lock().expect("pool lock poisoned");
            let pool = slot.get_or_insert_with(|| {
                let pool_config = self.config.pool_config(kind);
                log::debug!(
                    "creating {} pool ({})",
                    kind.name(),
                    format_bytes(pool_config.preferred_pool_size)
                );
                self.total_pool_bytes
                    .fetch_add(pool_config.preferred_pool_size, Ordering::Relaxed);
                TypedPool::new(kind, pool_config)
            });

            let aligned = pool.aligned_size(size);

            if !pool.can_allocate(aligned) {
                self.try_grow(pool, aligned);
            }

            if pool.can_allocate(aligned) {
                let id = self.next_allocation_id.fetch_add(1, Ordering::Relaxed);
                let offset = pool
                    .allocate(id, aligned)
                    .expect("can_allocate held a fitting block");
                self.total_used.fetch_add(aligned, Ordering::Relaxed);
                self.allocation_count.fetch_add(1, Ordering::Relaxed);
                Ok(PoolAllocation {
                    kind,
                    size_bytes: aligned,
                    alignment: pool.config().allocation_alignment,
                    offset,
                    id,
                    allocated_at: Instant::now(),
                })
            } else {
                let reason = format!(
                    "pool exhausted ({} used of {})",
                    format_bytes(pool.used_size()),
                    format_bytes(pool.total_size())
                );
                Err(TerrainError::allocation(kind, size, reason))
            }
        };

        match result {
            Ok(allocation) => {
                self.refresh_global_stats();
                self.check_memory_pressure();
                Ok(allocation)
            }
            Err(e) => {
                self.failed_count.fetch_add(1, Ordering::Relaxed);
                log::warn!("allocation failed: {e}");
                Err(e)
            }
        }
    }

    pub fn allocate_vertex_buffer(&self, size: u64) -> TerrainResult<PoolAllocation> {
        self.allocate(PoolKind::VertexBuffer, size)
    }

    pub fn allocate_index_buffer(&self, size: u64) -> TerrainResult<PoolAllocation> {
        self.allocate(PoolKind::IndexBuffer, size)
    }

    pub fn allocate_uniform_buffer(&self, size: u64) -> TerrainResult<PoolAllocation> {
        self.allocate(PoolKind::UniformBuffer, size)
    }

    pub fn allocate_staging_buffer(&self, size: u64) -> TerrainResult<PoolAllocation> {
        self.allocate(PoolKind::StagingBuffer, size)
    }

    pub fn allocate_compute_buffer(&self, size: u64) -> TerrainResult<PoolAllocation> {
        self.allocate(PoolKind::ComputeBuffer, size)
    }

    /// Allocate backing for a `width`×`height` 2D texture with
    /// `bytes_per_pixel`. `kind` must be one of the texture categories.
    pub fn allocate_texture2d(
        &self,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        kind: PoolKind,
    ) -> TerrainResult<PoolAllocation> {
        if !kind.is_texture() {
            return Err(TerrainError::allocation(
                kind,
                0,
                "allocate_texture2d requires a texture pool kind",
            ));
        }
        let size = width as u64 * height as u64 * bytes_per_pixel as u64;
        self.allocate(kind, size)
    }

    /// Release an allocation. Consumes the handle, so each allocation can be
    /// released at most once.
    pub fn deallocate(&self, allocation: PoolAllocation) {
        {
            let mut slot = self.pools[allocation.kind.index()]
                .lock()
                .expect("pool lock poisoned");
            match slot.as_mut().and_then(|pool| pool.free(allocation.id)) {
                Some(freed) => {
                    self.total_used.fetch_sub(freed, Ordering::Relaxed);
                    self.deallocation_count.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    log::error!(
                        "deallocate of unknown {} allocation id {}",
                        allocation.kind.name(),
                        allocation.id
                    );
                }
            }
        }
        self.refresh_global_stats();
        self.reset_pressure_latches();
    }

    /// Global usage ratio: total used bytes across all pools over the
    /// configured budget.
    pub fn memory_usage_ratio(&self) -> f32 {
        if self.config.max_total_memory == 0 {
            return 0.0;
        }
        self.total_used.load(Ordering::Relaxed) as f32 / self.config.max_total_memory as f32
    }

    pub fn is_memory_pressure(&self) -> bool {
        self.memory_usage_ratio() > self.config.warning_threshold
    }

    pub fn is_critical_memory_pressure(&self) -> bool {
        self.memory_usage_ratio() > self.config.critical_threshold
    }

    pub fn set_memory_pressure_callback<F>(&self, callback: F)
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        *self.pressure_callback.lock().expect("callback lock poisoned") = Some(Box::new(callback));
    }

    /// Forced pressure relief: reconcile tracking, then run a bounded
    /// defragmentation pass over every pool irrespective of the per-kind
    /// `enable_defragmentation` flag.
    pub fn handle_memory_pressure(&self) {
        log::warn!(
            "memory pressure: usage ratio {:.2}",
            self.memory_usage_ratio()
        );
        self.garbage_collect();
        self.defragment_internal(Duration::from_millis(50), true);
    }

    /// Reconcile the global counters with the per-pool accounting. With
    /// move-only handles nothing can dangle, so this only repairs drift.
    pub fn garbage_collect(&self) {
        let mut used = 0u64;
        for slot in &self.pools {
            if let Some(pool) = slot.lock().expect("pool lock poisoned").as_ref() {
                used += pool.used_size();
            }
        }
        self.total_used.store(used, Ordering::Relaxed);
        self.refresh_global_stats();
    }

    /// Bounded defragmentation over pools with defragmentation enabled.
    /// Returns `Timeout` when the wall-clock budget runs out mid-pass; the
    /// next invocation resumes from the saved cursor.
    pub fn defragment(&self, budget_ms: u64) -> DefragStatus {
        self.defragment_internal(Duration::from_millis(budget_ms), false)
    }

    fn defragment_internal(&self, budget: Duration, force: bool) -> DefragStatus {
        let start = Instant::now();
        let mut stats = DefragStats {
            fragmentation_before: self.average_fragmentation(),
            ..Default::default()
        };

        let cursor = self.defrag_cursor.load(Ordering::Relaxed);
        for step in 0..PoolKind::COUNT {
            let index = (cursor + step) % PoolKind::COUNT;
            {
                let mut slot = self.pools[index].lock().expect("pool lock poisoned");
                if let Some(pool) = slot.as_mut() {
                    if force || pool.config().enable_defragmentation {
                        stats.blocks_merged += pool.merge_free_blocks();
                        stats.pools_visited += 1;
                    }
                }
            }
            if start.elapsed() > budget {
                self.defrag_cursor
                    .store((index + 1) % PoolKind::COUNT, Ordering::Relaxed);
                stats.fragmentation_after = self.average_fragmentation();
                stats.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                return DefragStatus::Timeout(stats);
            }
        }

        self.defrag_cursor.store(0, Ordering::Relaxed);
        stats.fragmentation_after = self.average_fragmentation();
        stats.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        DefragStatus::Completed(stats)
    }

    /// Periodic bookkeeping driven by the streaming maintenance thread:
    /// reconcile counters, and every few seconds run a budgeted
    /// defragmentation pass when fragmentation warrants it.
    pub fn run_maintenance(&self) {
        self.garbage_collect();

        if !self.config.enable_auto_defragmentation {
            return;
        }
        let due = {
            let last = self.last_defrag.lock().expect("defrag lock poisoned");
            last.elapsed() > Duration::from_secs(5)
        };
        if due && self.average_fragmentation() > self.config.defragmentation_threshold {
            self.defragment(self.config.max_defragmentation_time_ms);
            *self.last_defrag.lock().expect("defrag lock poisoned") = Instant::now();
        }

        self.check_memory_pressure();
    }

    pub fn get_stats(&self) -> MemoryStats {
        self.refresh_global_stats();
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Per-pool `(used, total)` bytes; `(0, 0)` when the pool was never used.
    pub fn pool_usage(&self, kind: PoolKind) -> (u64, u64) {
        self.pools[kind.index()]
            .lock()
            .expect("pool lock poisoned")
            .as_ref()
            .map(|pool| (pool.used_size(), pool.total_size()))
            .unwrap_or((0, 0))
    }

    /// Log a human-readable summary of the allocator state.
    pub fn dump_memory_info(&self) {
        for line in self.get_memory_report() {
            log::info!("{line}");
        }
    }

    pub fn get_memory_report(&self) -> Vec<String> {
        let stats = self.get_stats();
        let mut report = vec![
            "Terrain Memory Allocator Report".to_string(),
            "================================".to_string(),
            format!("  Total Allocated: {}", format_bytes(stats.total_allocated)),
            format!("  Total Used: {}", format_bytes(stats.total_used)),
            format!("  Usage Ratio: {:.2}%", self.memory_usage_ratio() * 100.0),
            format!("  Fragmentation: {:.2}%", stats.fragmentation * 100.0),
            format!("  Active Allocations: {}", stats.active_allocations),
        ];
        for kind in PoolKind::ALL {
            let (used, total) = self.pool_usage(kind);
            if total == 0 {
                continue;
            }
            report.push(format!(
                "  {}: {} used of {}",
                kind.name(),
                format_bytes(used),
                format_bytes(total)
            ));
        }
        report
    }

    /// One growth step by `growth_factor`; a request that still does not fit
    /// afterwards is rejected by the caller.
    fn try_grow(&self, pool: &mut TypedPool, _needed: u64) {
        let config = *pool.config();
        let grown = (pool.total_size() as f64 * config.growth_factor as f64).ceil() as u64;
        let new_total = grown.max(config.min_pool_size);
        if new_total <= pool.total_size() {
            return;
        }
        let delta = new_total - pool.total_size();
        if self.total_pool_bytes.load(Ordering::Relaxed) + delta > self.config.max_total_memory {
            return;
        }
        if pool.resize(new_total) {
            self.total_pool_bytes.fetch_add(delta, Ordering::Relaxed);
            log::debug!(
                "grew {} pool to {}",
                pool.kind().name(),
                format_bytes(new_total)
            );
        }
    }

    fn average_fragmentation(&self) -> f32 {
        let mut total = 0.0f32;
        let mut pools = 0u32;
        for slot in &self.pools {
            if let Some(pool) = slot.lock().expect("pool lock poisoned").as_ref() {
                total += pool.fragmentation();
                pools += 1;
            }
        }
        if pools == 0 {
            0.0
        } else {
            total / pools as f32
        }
    }

    fn refresh_global_stats(&self) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total_allocated = 0;
        stats.total_used = 0;
        stats.total_free = 0;
        stats.active_allocations = 0;
        stats.pool_count = 0;
        stats.allocated_by_kind.clear();
        stats.used_by_kind.clear();
        stats.count_by_kind.clear();

        let mut fragmentation = 0.0f32;
        for (index, slot) in self.pools.iter().enumerate() {
            let guard = slot.lock().expect("pool lock poisoned");
            let Some(pool) = guard.as_ref() else { continue };
            let kind = PoolKind::ALL[index];
            stats.total_allocated += pool.total_size();
            stats.total_used += pool.used_size();
            stats.total_free += pool.free_size();
            stats.active_allocations += pool.active_allocations();
            stats.pool_count += 1;
            stats.allocated_by_kind.insert(kind, pool.total_size());
            stats.used_by_kind.insert(kind, pool.used_size());
            stats.count_by_kind.insert(kind, pool.active_allocations());
            fragmentation += pool.fragmentation();
        }
        stats.fragmentation = if stats.pool_count == 0 {
            0.0
        } else {
            fragmentation / stats.pool_count as f32
        };
        stats.total_allocations = self.allocation_count.load(Ordering::Relaxed);
        stats.total_deallocations = self.deallocation_count.load(Ordering::Relaxed);
        stats.failed_allocations = self.failed_count.load(Ordering::Relaxed);
    }

    /// Edge-triggered pressure check: each threshold notifies once per
    /// crossing; latches reset once usage falls back below the threshold.
    fn check_memory_pressure(&self) {
        let ratio = self.memory_usage_ratio();
        if ratio > self.config.critical_threshold {
            if !self.critical_latched.swap(true, Ordering::AcqRel) {
                self.notify_pressure(ratio);
                self.handle_memory_pressure();
            }
        } else if ratio > self.config.warning_threshold {
            self.critical_latched.store(false, Ordering::Release);
            if !self.warning_latched.swap(true, Ordering::AcqRel) {
                self.notify_pressure(ratio);
            }
        } else {
            self.reset_pressure_latches();
        }
    }

    fn reset_pressure_latches(&self) {
        let ratio = self.memory_usage_ratio();
        if ratio <= self.config.warning_threshold {
            self.warning_latched.store(false, Ordering::Release);
        }
        if ratio <= self.config.critical_threshold {
            self.critical_latched.store(false, Ordering::Release);
        }
    }

    fn notify_pressure(&self, ratio: f32) {
        if let Some(callback) = self
            .pressure_callback
            .lock()
            .expect("callback lock poisoned")
            .as_ref()
        {
            callback(ratio);
        }
    }
}
