//! Background streaming: load workers and allocator maintenance.
//!
//! The scheduler never touches the tile registry. The render thread pushes
//! [`LoadRequest`]s into a bounded channel; a fixed pool of workers drains
//! it (host cache first, then the dataset source) and answers with
//! [`LoadCompletion`] messages that the manager applies on its own thread.
//! A separate low-frequency thread drives allocator garbage collection and
//! defragmentation.

use crate::core::memory_pool::MemoryPoolAllocator;
use crate::error::{TerrainError, TerrainResult};
use crate::terrain::coordinate::TileCoordinate;
use crate::terrain::dataset::{TileDataCache, TileDataSource, TileSourceData};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Worker thread count; 0 sizes the pool from hardware concurrency.
    pub worker_threads: usize,
    /// Bound of the load-request channel.
    pub queue_capacity: usize,
    /// Entries kept in the host-side payload cache.
    pub cache_capacity: usize,
    /// Cadence of the allocator maintenance thread.
    pub maintenance_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            queue_capacity: 256,
            cache_capacity: 64,
            maintenance_interval_ms: 100,
        }
    }
}

impl StreamingConfig {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        let parallelism = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        (parallelism / 4).max(1)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// One unit of work for the load workers. The generation stamps which claim
/// of the tile this load belongs to; stale completions are discarded by the
/// manager.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub coordinate: TileCoordinate,
    pub generation: u64,
}

/// Outcome of one load, reported back to the manager.
#[derive(Debug)]
pub struct LoadCompletion {
    pub coordinate: TileCoordinate,
    pub generation: u64,
    pub result: TerrainResult<Arc<TileSourceData>>,
    pub duration: Duration,
}

pub struct StreamingScheduler {
    request_tx: Option<mpsc::SyncSender<LoadRequest>>,
    completion_rx: Mutex<mpsc::Receiver<LoadCompletion>>,
    workers: Vec<thread::JoinHandle<()>>,
    maintenance: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl StreamingScheduler {
    pub fn new(
        source: Arc<dyn TileDataSource>,
        allocator: Arc<MemoryPoolAllocator>,
        config: StreamingConfig,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::sync_channel::<LoadRequest>(config.queue_capacity);
        let (completion_tx, completion_rx) = mpsc::channel::<LoadCompletion>();
        let request_rx = Arc::new(Mutex::new(request_rx));
        let cache = Arc::new(Mutex::new(TileDataCache::new(config.cache_capacity)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicU64::new(0));

        let worker_count = config.effective_worker_threads();
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let request_rx = Arc::clone(&request_rx);
            let completion_tx = completion_tx.clone();
            let source = Arc::clone(&source);
            let cache = Arc::clone(&cache);
            let shutdown = Arc::clone(&shutdown);
            let completed = Arc::clone(&completed);
            workers.push(
                thread::Builder::new()
                    .name(format!("terrain-load-{index}"))
                    .spawn(move || {
                        load_worker(request_rx, completion_tx, source, cache, shutdown, completed)
                    })
                    .expect("spawn load worker"),
            );
        }
        drop(completion_tx);

        let maintenance = {
            let shutdown = Arc::clone(&shutdown);
            let interval = config.maintenance_interval();
            Some(
                thread::Builder::new()
                    .name("terrain-maintenance".to_string())
                    .spawn(move || {
                        while !shutdown.load(Ordering::Relaxed) {
                            thread::sleep(interval);
                            if shutdown.load(Ordering::Relaxed) {
                                break;
                            }
                            allocator.run_maintenance();
                        }
                    })
                    .expect("spawn maintenance thread"),
            )
        };

        log::info!("streaming scheduler started with {worker_count} load workers");

        Self {
            request_tx: Some(request_tx),
            completion_rx: Mutex::new(completion_rx),
            workers,
            maintenance,
            shutdown,
            submitted: AtomicU64::new(0),
            completed,
        }
    }

    /// Enqueue a load without blocking. Fails with
    /// [`TerrainError::QueueFull`] when the bounded channel is at capacity;
    /// the caller retries on a later frame.
    pub fn request_load(&self, request: LoadRequest) -> TerrainResult<()> {
        let Some(tx) = self.request_tx.as_ref() else {
            return Err(TerrainError::QueueFull);
        };
        match tx.try_send(request) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(TerrainError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(TerrainError::QueueFull),
        }
    }

    /// Drain all completions that arrived since the last poll. Non-blocking.
    pub fn poll_completions(&self) -> Vec<LoadCompletion> {
        self.completion_rx
            .lock()
            .expect("completion lock poisoned")
            .try_iter()
            .collect()
    }

    /// Requests submitted but not yet completed (approximate).
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .load(Ordering::Relaxed)
            .saturating_sub(self.completed.load(Ordering::Relaxed))
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Closing the request channel wakes blocked workers immediately.
        self.request_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(maintenance) = self.maintenance.take() {
            let _ = maintenance.join();
        }
    }
}

impl Drop for StreamingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn load_worker(
    request_rx: Arc<Mutex<mpsc::Receiver<LoadRequest>>>,
    completion_tx: mpsc::Sender<LoadCompletion>,
    source: Arc<dyn TileDataSource>,
    cache: Arc<Mutex<TileDataCache>>,
    shutdown: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        // Hold the receiver lock only for the dequeue, then nap briefly when
        // the queue is empty rather than busy-spinning.
        let request = {
            let receiver = request_rx.lock().expect("request lock poisoned");
            receiver.recv_timeout(Duration::from_millis(10))
        };

        let request = match request {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let start = Instant::now();
        let result = load_payload(&request.coordinate, source.as_ref(), &cache);
        if let Err(e) = &result {
            log::warn!("worker load failed for {}: {e}", request.coordinate);
        }

        completed.fetch_add(1, Ordering::Relaxed);
        let completion = LoadCompletion {
            coordinate: request.coordinate,
            generation: request.generation,
            result,
            duration: start.elapsed(),
        };
        if completion_tx.send(completion).is_err() {
            break; // scheduler is gone
        }
    }
}

fn load_payload(
    coordinate: &TileCoordinate,
    source: &dyn TileDataSource,
    cache: &Mutex<TileDataCache>,
) -> TerrainResult<Arc<TileSourceData>> {
    if let Some(hit) = cache.lock().expect("cache lock poisoned").get(coordinate) {
        return Ok(hit);
    }

    // The dataset read happens outside the cache lock.
    let payload = source.load_tile_data(coordinate)?;
    payload.validate()?;
    let payload = Arc::new(payload);
    cache
        .lock()
        .expect("cache lock poisoned")
        .insert(coordinate.clone(), Arc::clone(&payload));
    Ok(payload)
}
