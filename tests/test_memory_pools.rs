//! Tests for the typed terrain memory pools.
//!
//! These tests validate budget accounting, pressure thresholds, bounded
//! defragmentation and multi-threaded allocation safety. The pools are pure
//! accounting structures, so no GPU device is required.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use terrastream::core::memory_pool::{
    DefragStatus, MemoryConfig, MemoryPoolAllocator, PoolAllocation, PoolConfig, PoolKind,
};
use terrastream::TerrainError;

const MIB: u64 = 1024 * 1024;

fn config_with_vertex_pool(preferred: u64, max_total: u64) -> MemoryConfig {
    let mut config = MemoryConfig {
        max_total_memory: max_total,
        ..Default::default()
    };
    config.pool_configs.insert(
        PoolKind::VertexBuffer,
        PoolConfig {
            preferred_pool_size: preferred,
            min_pool_size: preferred,
            allocation_alignment: 256,
            enable_defragmentation: true,
            growth_factor: 1.0,
        },
    );
    config
}

#[test]
fn used_never_exceeds_total_under_churn() {
    let allocator = MemoryPoolAllocator::new(config_with_vertex_pool(MIB, 4 * MIB));
    let mut live: Vec<PoolAllocation> = Vec::new();

    for step in 0u64..500 {
        if step % 3 == 2 {
            if let Some(allocation) = live.pop() {
                allocator.deallocate(allocation);
            }
        } else if let Ok(allocation) =
            allocator.allocate_vertex_buffer(100 + (step % 7) * 1000)
        {
            live.push(allocation);
        }

        let (used, total) = allocator.pool_usage(PoolKind::VertexBuffer);
        assert!(used <= total, "pool bound violated: {used} > {total}");
    }

    let outstanding: u64 = live.iter().map(|a| a.size_bytes()).sum();
    let (used, _) = allocator.pool_usage(PoolKind::VertexBuffer);
    assert_eq!(used, outstanding);
}

#[test]
fn exhausted_pool_rejects_without_panicking() {
    let allocator = MemoryPoolAllocator::new(config_with_vertex_pool(MIB, MIB));
    let result = allocator.allocate_vertex_buffer(2 * MIB);
    match result {
        Err(TerrainError::Allocation { kind, requested, .. }) => {
            assert_eq!(kind, PoolKind::VertexBuffer);
            assert_eq!(requested, 2 * MIB);
        }
        other => panic!("expected AllocationFailure, got {other:?}"),
    }
    assert_eq!(allocator.get_stats().failed_allocations, 1);
    assert_eq!(allocator.pool_usage(PoolKind::VertexBuffer).0, 0);
}

#[test]
fn pressure_callback_fires_once_per_crossing() {
    // 10 MiB budget, warning at 0.7, critical at 0.9.
    let mut config = config_with_vertex_pool(10 * MIB, 10 * MIB);
    config.warning_threshold = 0.7;
    config.critical_threshold = 0.9;
    let allocator = MemoryPoolAllocator::new(config);

    let notifications = Arc::new(Mutex::new(Vec::<f32>::new()));
    {
        let notifications = Arc::clone(&notifications);
        allocator.set_memory_pressure_callback(move |ratio| {
            notifications.lock().unwrap().push(ratio);
        });
    }

    // Climb to 80% in 1 MiB steps: exactly one warning notification.
    let mut live = Vec::new();
    for _ in 0..8 {
        live.push(allocator.allocate_vertex_buffer(MIB).unwrap());
    }
    assert_eq!(notifications.lock().unwrap().len(), 1);
    assert!(allocator.is_memory_pressure());
    assert!(!allocator.is_critical_memory_pressure());

    // Cross critical: exactly one more notification.
    live.push(allocator.allocate_vertex_buffer(MIB).unwrap());
    live.push(allocator.allocate_vertex_buffer(MIB / 2).unwrap());
    let after_critical = notifications.lock().unwrap().len();
    assert_eq!(after_critical, 2);
    assert!(allocator.is_critical_memory_pressure());

    // Releasing drops the ratio below both thresholds and re-arms them.
    let before = allocator.memory_usage_ratio();
    for allocation in live.drain(..) {
        allocator.deallocate(allocation);
    }
    assert!(allocator.memory_usage_ratio() < before);

    let mut live2 = Vec::new();
    for _ in 0..8 {
        live2.push(allocator.allocate_vertex_buffer(MIB).unwrap());
    }
    assert_eq!(notifications.lock().unwrap().len(), 3);
    for allocation in live2 {
        allocator.deallocate(allocation);
    }
}

#[test]
fn critical_pressure_triggers_forced_handling() {
    let mut config = config_with_vertex_pool(10 * MIB, 10 * MIB);
    config.warning_threshold = 0.5;
    config.critical_threshold = 0.6;
    let allocator = MemoryPoolAllocator::new(config);

    let crossings = Arc::new(AtomicU32::new(0));
    {
        let crossings = Arc::clone(&crossings);
        allocator.set_memory_pressure_callback(move |_| {
            crossings.fetch_add(1, Ordering::SeqCst);
        });
    }

    let a = allocator.allocate_vertex_buffer(7 * MIB).unwrap();
    // One allocation jumped straight past critical: a single notification.
    assert_eq!(crossings.load(Ordering::SeqCst), 1);
    allocator.deallocate(a);
}

#[test]
fn defragmentation_honors_time_budget() {
    let allocator = MemoryPoolAllocator::default();

    // Fragment a few pools: free the outer blocks, hold the middle one so
    // the holes cannot coalesce away.
    let mut keep = Vec::new();
    for kind in [PoolKind::VertexBuffer, PoolKind::UniformBuffer, PoolKind::ComputeBuffer] {
        let a = allocator.allocate(kind, 4096).unwrap();
        let b = allocator.allocate(kind, 4096).unwrap();
        let c = allocator.allocate(kind, 4096).unwrap();
        allocator.deallocate(a);
        allocator.deallocate(c);
        keep.push(b);
    }

    // A zero budget times out immediately; the status is non-fatal.
    let status = allocator.defragment(0);
    assert!(matches!(status, DefragStatus::Timeout(_)));

    // The next pass resumes and completes under a generous budget.
    let status = allocator.defragment(1000);
    assert!(matches!(status, DefragStatus::Completed(_)));
    assert!(status.stats().pools_visited >= 3);
}

#[test]
fn texture_pools_are_excluded_from_routine_defrag() {
    let allocator = MemoryPoolAllocator::default();
    let a = allocator.allocate_texture2d(256, 256, 4, PoolKind::HeightTexture).unwrap();
    allocator.deallocate(a);

    let status = allocator.defragment(1000);
    // Only pools with defragmentation enabled are visited; the height
    // texture pool exists but is skipped.
    assert_eq!(status.stats().pools_visited, 0);
}

#[test]
fn concurrent_churn_keeps_accounting_consistent() {
    let mut config = config_with_vertex_pool(64 * MIB, 256 * MIB);
    config.pool_configs.insert(
        PoolKind::StagingBuffer,
        PoolConfig {
            preferred_pool_size: 64 * MIB,
            min_pool_size: 64 * MIB,
            allocation_alignment: 64,
            enable_defragmentation: true,
            growth_factor: 1.0,
        },
    );
    let allocator = Arc::new(MemoryPoolAllocator::new(config));

    let mut handles = Vec::new();
    for worker in 0..2u64 {
        let allocator = Arc::clone(&allocator);
        handles.push(thread::spawn(move || {
            // Deterministic per-thread pseudo-random sizes.
            let mut state = 0x9e3779b9u64.wrapping_add(worker);
            let mut live: Vec<PoolAllocation> = Vec::new();
            let mut outstanding = 0u64;

            for _ in 0..10_000 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let size = 64 + (state >> 33) % 8192;
                if state & 1 == 0 || live.is_empty() {
                    if let Ok(allocation) = allocator.allocate_staging_buffer(size) {
                        outstanding += allocation.size_bytes();
                        live.push(allocation);
                    }
                } else {
                    let index = ((state >> 7) as usize) % live.len();
                    let allocation = live.swap_remove(index);
                    outstanding -= allocation.size_bytes();
                    allocator.deallocate(allocation);
                }
            }

            for allocation in &live {
                assert!(allocation.size_bytes() > 0);
            }
            // Leave the survivors allocated; the main thread checks totals.
            (live, outstanding)
        }));
    }

    let mut total_outstanding = 0u64;
    let mut survivors = Vec::new();
    for handle in handles {
        let (live, outstanding) = handle.join().unwrap();
        total_outstanding += outstanding;
        survivors.extend(live);
    }

    let (used, total) = allocator.pool_usage(PoolKind::StagingBuffer);
    assert_eq!(used, total_outstanding);
    assert!(used <= total);

    for allocation in survivors {
        allocator.deallocate(allocation);
    }
    assert_eq!(allocator.pool_usage(PoolKind::StagingBuffer).0, 0);
}

#[test]
fn memory_report_reflects_live_pools() {
    let allocator = MemoryPoolAllocator::default();
    let a = allocator.allocate_vertex_buffer(MIB).unwrap();
    let b = allocator.allocate_texture2d(512, 512, 4, PoolKind::NormalTexture).unwrap();

    let report = allocator.get_memory_report();
    assert!(report.iter().any(|l| l.contains("VertexBuffer")));
    assert!(report.iter().any(|l| l.contains("NormalTexture")));
    assert!(report.iter().any(|l| l.contains("Usage Ratio")));

    let stats = allocator.get_stats();
    assert_eq!(stats.active_allocations, 2);
    assert_eq!(stats.total_allocations, 2);

    allocator.deallocate(a);
    allocator.deallocate(b);
    assert_eq!(allocator.get_stats().active_allocations, 0);
}
