//! End-to-end streaming tests: manager + scheduler + (optionally) GPU
//! promotion through the typed memory pools.

use glam::Vec3;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use terrastream::core::memory_pool::{MemoryPoolAllocator, PoolKind};
use terrastream::terrain::{
    StreamingConfig, StreamingScheduler, SyntheticTileSource, TerrainTileManager, TileCoordinate,
    TileManagerConfig, TileState,
};
use terrastream::GpuContext;

fn test_gpu() -> Option<GpuContext> {
    match GpuContext::new() {
        Ok(gpu) => Some(gpu),
        Err(e) => {
            eprintln!("skipping GPU-backed test: {e}");
            None
        }
    }
}

fn streaming_setup(
    tile_resolution: u32,
) -> (TerrainTileManager, StreamingScheduler, Arc<MemoryPoolAllocator>) {
    let allocator = Arc::new(MemoryPoolAllocator::default());
    let manager = TerrainTileManager::new(
        TileManagerConfig::default(),
        Arc::clone(&allocator),
    );
    let scheduler = StreamingScheduler::new(
        Arc::new(SyntheticTileSource::new(tile_resolution, 50.0)),
        Arc::clone(&allocator),
        StreamingConfig {
            worker_threads: 2,
            queue_capacity: 64,
            cache_capacity: 32,
            maintenance_interval_ms: 50,
        },
    );
    (manager, scheduler, allocator)
}

/// Pump completions until `predicate` holds or the deadline passes.
fn pump_until(
    manager: &mut TerrainTileManager,
    scheduler: &StreamingScheduler,
    gpu: Option<&GpuContext>,
    predicate: impl Fn(&TerrainTileManager) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        manager.integrate_completions(scheduler, gpu, 16);
        if predicate(manager) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn tiles_stream_to_loaded_without_gpu() {
    let (mut manager, scheduler, _allocator) = streaming_setup(32);

    for i in 0..12 {
        manager.create_tile(TileCoordinate::new(i, 0, 0, "ds"));
    }
    manager.update_priorities(Vec3::new(0.0, 100.0, 0.0), 0.016);

    let dispatched = manager.schedule_streaming(&scheduler, 12);
    assert_eq!(dispatched, 12);

    let done = pump_until(&mut manager, &scheduler, None, |m| {
        (0..12).all(|i| {
            m.get_tile(&TileCoordinate::new(i, 0, 0, "ds"))
                .map(|t| t.state() == TileState::Loaded)
                .unwrap_or(false)
        })
    });
    assert!(done, "tiles did not reach Loaded in time");

    let stats = manager.get_stats();
    assert_eq!(stats.loading_tiles, 0);
    assert_eq!(stats.error_tiles, 0);
    assert!(stats.memory_usage > 0);
}

#[test]
fn nearest_tiles_are_dispatched_first() {
    let (mut manager, scheduler, _allocator) = streaming_setup(16);

    manager.create_tile(TileCoordinate::new(50, 50, 0, "ds"));
    manager.create_tile(TileCoordinate::new(0, 0, 0, "ds"));
    manager.update_priorities(Vec3::new(500.0, 100.0, 500.0), 0.016);

    // Only one slot: the near tile must win it.
    let dispatched = manager.schedule_streaming(&scheduler, 1);
    assert_eq!(dispatched, 1);
    assert_eq!(
        manager
            .get_tile(&TileCoordinate::new(0, 0, 0, "ds"))
            .unwrap()
            .state(),
        TileState::Loading
    );
    assert!(manager
        .get_tile(&TileCoordinate::new(50, 50, 0, "ds"))
        .unwrap()
        .state()
        .is_loadable());
}

#[test]
fn removed_tile_discards_its_inflight_result() {
    let (mut manager, scheduler, _allocator) = streaming_setup(32);

    let coordinate = TileCoordinate::new(7, 7, 0, "ds");
    manager.create_tile(coordinate.clone());
    manager.schedule_streaming(&scheduler, 1);

    // The tile disappears while the worker is (possibly still) loading.
    manager.remove_tile(&coordinate);

    // A fresh tile at the same coordinate must not be corrupted by the
    // stale completion: its generation is new and it was never marked
    // Loading for the old request.
    manager.create_tile(coordinate.clone());

    // Give the stale completion time to arrive, then integrate.
    thread::sleep(Duration::from_millis(200));
    manager.integrate_completions(&scheduler, None, 16);

    let tile = manager.get_tile(&coordinate).unwrap();
    assert_eq!(tile.state(), TileState::Empty);
    assert!(tile.cpu_data().is_none());
}

#[test]
fn full_pipeline_reaches_ready_with_gpu() {
    let Some(gpu) = test_gpu() else { return };
    let (mut manager, scheduler, allocator) = streaming_setup(64);

    for i in 0..6 {
        manager.create_tile(TileCoordinate::new(i, 1, 0, "ds"));
    }
    manager.update_priorities(Vec3::new(0.0, 200.0, 0.0), 0.016);
    assert_eq!(manager.schedule_streaming(&scheduler, 6), 6);

    let done = pump_until(&mut manager, &scheduler, Some(&gpu), |m| {
        m.get_stats().ready_tiles == 6
    });
    assert!(done, "tiles did not reach Ready in time");

    // GPU-iff-Ready, and the pools carry the backing bytes.
    for i in 0..6 {
        let tile = manager.get_tile(&TileCoordinate::new(i, 1, 0, "ds")).unwrap();
        assert_eq!(tile.state(), TileState::Ready);
        assert!(tile.has_valid_gpu_resources());
        assert!(tile.gpu_memory_usage() > 0);
    }
    assert!(allocator.pool_usage(PoolKind::VertexBuffer).0 > 0);
    assert!(allocator.pool_usage(PoolKind::HeightTexture).0 > 0);
    assert!(allocator.pool_usage(PoolKind::NormalTexture).0 > 0);

    // Unloading a tile returns its bytes; GPU-iff-Ready holds on the way
    // down too.
    let coordinate = TileCoordinate::new(0, 1, 0, "ds");
    let before = allocator.pool_usage(PoolKind::HeightTexture).0;
    manager
        .get_tile_mut(&coordinate)
        .unwrap()
        .unload_from_gpu(&allocator);
    let tile = manager.get_tile(&coordinate).unwrap();
    assert_eq!(tile.state(), TileState::Loaded);
    assert!(!tile.has_valid_gpu_resources());
    assert_eq!(tile.gpu_memory_usage(), 0);
    assert!(allocator.pool_usage(PoolKind::HeightTexture).0 < before);
}

#[test]
fn upload_failure_marks_tile_error_and_leaves_no_partial_resources() {
    let Some(gpu) = test_gpu() else { return };

    // Vertex pool far too small for the 64×64×32 B base mesh.
    let mut memory = terrastream::core::memory_pool::MemoryConfig::default();
    memory.pool_configs.insert(
        PoolKind::VertexBuffer,
        terrastream::core::memory_pool::PoolConfig {
            preferred_pool_size: 4096,
            min_pool_size: 4096,
            allocation_alignment: 256,
            enable_defragmentation: true,
            growth_factor: 1.0,
        },
    );
    let allocator = Arc::new(MemoryPoolAllocator::new(memory));
    let mut manager =
        TerrainTileManager::new(TileManagerConfig::default(), Arc::clone(&allocator));

    let coordinate = TileCoordinate::new(0, 0, 0, "ds1");
    manager
        .create_tile(coordinate.clone())
        .load_data(&SyntheticTileSource::new(64, 1.0))
        .unwrap();

    let result = manager
        .get_tile_mut(&coordinate)
        .unwrap()
        .upload_to_gpu(&gpu, &allocator);
    assert!(result.is_err());

    let tile = manager.get_tile(&coordinate).unwrap();
    assert_eq!(tile.state(), TileState::Error);
    assert!(tile.gpu_resources().is_none());
    assert!(tile.error_message().is_some());

    // All-or-nothing: nothing stayed reserved in any pool.
    assert_eq!(allocator.pool_usage(PoolKind::VertexBuffer).0, 0);
    assert_eq!(allocator.pool_usage(PoolKind::HeightTexture).0, 0);
    assert_eq!(allocator.pool_usage(PoolKind::NormalTexture).0, 0);
}
