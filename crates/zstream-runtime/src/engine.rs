use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use zstream_core::{ChunkKey, StreamConfig};
use zstream_observe::metrics::{Counter, DurationAgg, DurationAggSnapshot, ScopedTimer};
use zstream_store::{check_payload_len, ChunkStore};

use crate::cache::ChunkCache;

/// A predicted key waiting for a worker.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchTask {
    pub key: ChunkKey,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineCaps {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Upper bound on how long an idle worker waits before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Expected payload length; fetched chunks of any other length count as failures.
    pub chunk_nbytes: Option<u64>,
}

impl From<&StreamConfig> for EngineCaps {
    fn from(cfg: &StreamConfig) -> Self {
        Self {
            worker_count: cfg.worker_count,
            queue_capacity: cfg.prefetch_queue_capacity,
            poll_interval: cfg.poll_interval(),
            chunk_nbytes: None,
        }
    }
}

#[derive(Debug, Default)]
struct PrefetchMetrics {
    enqueued_total: Counter,
    dropped_queue_full_total: Counter,
    skipped_cached_total: Counter,
    skipped_inflight_total: Counter,
    prefetched_total: Counter,
    failures_total: Counter,
    fetch_latency: DurationAgg,
    queue_wait: DurationAgg,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PrefetchStats {
    pub enqueued: u64,
    pub dropped_queue_full: u64,
    pub skipped_cached: u64,
    pub skipped_inflight: u64,
    pub prefetched: u64,
    pub failures: u64,
    pub pending: usize,
    pub inflight: usize,
    pub fetch_latency: DurationAggSnapshot,
    pub queue_wait: DurationAggSnapshot,
}

struct Shared {
    cache: Arc<ChunkCache>,
    store: Arc<dyn ChunkStore>,
    tasks: Receiver<PrefetchTask>,
    inflight: Mutex<HashSet<ChunkKey>>,
    metrics: PrefetchMetrics,
    poll_interval: Duration,
    chunk_nbytes: Option<u64>,
}

struct Running {
    /// Dropping this disconnects every worker's shutdown receiver.
    shutdown: Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Background workers that pull predicted keys off a bounded queue and warm the cache.
///
/// Everything here is best effort: a full queue drops the task, a failed fetch is
/// logged and counted, and nothing ever reaches the consumer.
pub struct PrefetchEngine {
    shared: Arc<Shared>,
    tx: Sender<PrefetchTask>,
    worker_count: usize,
    running: Mutex<Option<Running>>,
}

impl PrefetchEngine {
    pub fn new(cache: Arc<ChunkCache>, store: Arc<dyn ChunkStore>, caps: EngineCaps) -> Self {
        let (tx, rx) = channel::bounded(caps.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                cache,
                store,
                tasks: rx,
                inflight: Mutex::new(HashSet::new()),
                metrics: PrefetchMetrics::default(),
                poll_interval: caps.poll_interval.max(Duration::from_millis(1)),
                chunk_nbytes: caps.chunk_nbytes,
            }),
            tx,
            worker_count: caps.worker_count.max(1),
            running: Mutex::new(None),
        }
    }

    /// Spawns the worker pool. A no-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let mut workers = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let shared = self.shared.clone();
            let shutdown = shutdown_rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("zstream-prefetch-{worker_id}"))
                .spawn(move || worker_loop(&shared, &shutdown));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    drop(shutdown_tx);
                    join_all(workers);
                    return Err(anyhow::anyhow!("spawn prefetch worker {worker_id}: {err}"));
                }
            }
        }

        tracing::info!(
            target: "zstream",
            event = "prefetch_started",
            workers = self.worker_count,
            queue_capacity = self.tx.capacity().unwrap_or(0),
            "prefetch engine started"
        );
        *running = Some(Running {
            shutdown: shutdown_tx,
            workers,
        });
        Ok(())
    }

    /// Signals workers to exit after their current task and waits for them.
    ///
    /// In-flight fetches run to completion; queued tasks stay queued.
    pub fn stop(&self) {
        let Some(Running { shutdown, workers }) = self.running.lock().take() else {
            return;
        };
        drop(shutdown);
        join_all(workers);
        tracing::info!(
            target: "zstream",
            event = "prefetch_stopped",
            pending = self.tx.len(),
            "prefetch engine stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Queues keys for background fetch, returning how many were accepted.
    ///
    /// Never blocks: keys that do not fit in the queue are dropped and counted.
    pub fn enqueue<I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = ChunkKey>,
    {
        let metrics = &self.shared.metrics;
        let mut accepted = 0usize;
        for key in keys {
            let task = PrefetchTask {
                key,
                enqueued_at: Instant::now(),
            };
            match self.tx.try_send(task) {
                Ok(()) => {
                    metrics.enqueued_total.inc();
                    accepted += 1;
                }
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    metrics.dropped_queue_full_total.inc();
                }
            }
        }
        accepted
    }

    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    pub fn stats(&self) -> PrefetchStats {
        let m = &self.shared.metrics;
        PrefetchStats {
            enqueued: m.enqueued_total.get(),
            dropped_queue_full: m.dropped_queue_full_total.get(),
            skipped_cached: m.skipped_cached_total.get(),
            skipped_inflight: m.skipped_inflight_total.get(),
            prefetched: m.prefetched_total.get(),
            failures: m.failures_total.get(),
            pending: self.tx.len(),
            inflight: self.shared.inflight.lock().len(),
            fetch_latency: m.fetch_latency.snapshot(),
            queue_wait: m.queue_wait.snapshot(),
        }
    }
}

impl Drop for PrefetchEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        if handle.join().is_err() {
            tracing::error!(target: "zstream", event = "prefetch_worker_panicked", "prefetch worker panicked");
        }
    }
}

/// Releases a key from the in-flight set when its fetch ends, including by unwinding.
struct InflightGuard<'a> {
    set: &'a Mutex<HashSet<ChunkKey>>,
    key: ChunkKey,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

fn worker_loop(shared: &Shared, shutdown: &Receiver<()>) {
    loop {
        channel::select! {
            recv(shutdown) -> _ => break,
            recv(shared.tasks) -> msg => match msg {
                Ok(task) => shared.run(task),
                Err(_) => break,
            },
            default(shared.poll_interval) => {}
        }
    }
}

impl Shared {
    fn run(&self, task: PrefetchTask) {
        let key = task.key;
        self.metrics.queue_wait.record(task.enqueued_at.elapsed());

        if self.cache.contains(key) {
            self.metrics.skipped_cached_total.inc();
            return;
        }
        if !self.inflight.lock().insert(key) {
            self.metrics.skipped_inflight_total.inc();
            return;
        }
        let _inflight = InflightGuard {
            set: &self.inflight,
            key,
        };

        let fetched = {
            let _timer = ScopedTimer::new(&self.metrics.fetch_latency);
            self.store.fetch(key)
        };
        let fetched = fetched.and_then(|payload| match self.chunk_nbytes {
            Some(expected) => check_payload_len(key, payload.len(), expected).map(|()| payload),
            None => Ok(payload),
        });

        match fetched {
            Ok(payload) => match self.cache.put(key, payload) {
                Ok(()) => self.metrics.prefetched_total.inc(),
                Err(err) => {
                    tracing::debug!(
                        target: "zstream",
                        event = "cache_reject",
                        key = %key,
                        error = %err,
                        "prefetched chunk does not fit in cache"
                    );
                }
            },
            Err(err) => {
                self.metrics.failures_total.inc();
                tracing::warn!(
                    target: "zstream",
                    event = "prefetch_failed",
                    key = %key,
                    not_found = err.is_not_found(),
                    error = %err,
                    "prefetch failed; dropping task"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use zstream_core::{ChunkGrid, Payload};
    use zstream_store::{FailureMode, FetchError, MemChunkStore};

    fn caps(workers: usize, queue: usize) -> EngineCaps {
        EngineCaps {
            worker_count: workers,
            queue_capacity: queue,
            poll_interval: Duration::from_millis(10),
            chunk_nbytes: None,
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn synthetic(num_chunks: u64) -> Arc<MemChunkStore> {
        let grid = ChunkGrid::new(vec![num_chunks * 4], vec![4], 1).unwrap();
        Arc::new(MemChunkStore::synthetic(grid))
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let cache = Arc::new(ChunkCache::new(1024));
        let engine = PrefetchEngine::new(cache, synthetic(16), caps(1, 2));
        // Not started, so nothing drains the queue.
        let accepted = engine.enqueue((0..5).map(ChunkKey));
        assert_eq!(accepted, 2);
        let stats = engine.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped_queue_full, 3);
        assert_eq!(stats.pending, 2);
    }

    #[test]
    fn workers_fill_the_cache() {
        let cache = Arc::new(ChunkCache::new(1024));
        let engine = PrefetchEngine::new(cache.clone(), synthetic(16), caps(2, 64));
        engine.start().unwrap();
        engine.enqueue((0..8).map(ChunkKey));
        assert!(wait_until(Duration::from_secs(5), || {
            (0..8).all(|k| cache.contains(ChunkKey(k)))
        }));
        engine.stop();
        assert_eq!(engine.stats().prefetched, 8);
    }

    #[test]
    fn cached_keys_are_skipped() {
        let cache = Arc::new(ChunkCache::new(1024));
        let store = synthetic(4);
        cache.put(ChunkKey(1), Arc::from(vec![9u8; 4])).unwrap();
        let engine = PrefetchEngine::new(cache.clone(), store.clone(), caps(1, 8));
        engine.enqueue([ChunkKey(1)]);
        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || engine.stats().skipped_cached == 1));
        assert_eq!(store.fetch_total(), 0);
    }

    #[test]
    fn failures_are_counted_and_workers_keep_going() {
        let cache = Arc::new(ChunkCache::new(1024));
        let grid = ChunkGrid::new(vec![16], vec![4], 1).unwrap();
        let store = Arc::new(
            MemChunkStore::synthetic(grid)
                .with_failure(FailureMode::Keys([ChunkKey(0)].into_iter().collect())),
        );
        let engine = PrefetchEngine::new(cache.clone(), store, caps(1, 8));
        engine.start().unwrap();
        engine.enqueue([ChunkKey(0), ChunkKey(1)]);
        assert!(wait_until(Duration::from_secs(5), || cache.contains(ChunkKey(1))));
        assert!(!cache.contains(ChunkKey(0)));
        assert_eq!(engine.stats().failures, 1);
    }

    #[test]
    fn start_is_idempotent_and_stop_is_prompt() {
        let cache = Arc::new(ChunkCache::new(1024));
        let engine = PrefetchEngine::new(cache, synthetic(4), caps(3, 8));
        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());

        let started = Instant::now();
        engine.stop();
        assert!(!engine.is_running());
        assert!(started.elapsed() < Duration::from_secs(2));
        engine.stop();
    }

    #[test]
    fn restart_after_stop_drains_queued_tasks() {
        let cache = Arc::new(ChunkCache::new(1024));
        let engine = PrefetchEngine::new(cache.clone(), synthetic(4), caps(1, 8));
        engine.start().unwrap();
        engine.stop();
        engine.enqueue([ChunkKey(2)]);
        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || cache.contains(ChunkKey(2))));
    }

    #[test]
    fn wrong_sized_payloads_are_failures_not_cache_entries() {
        let grid = ChunkGrid::new(vec![16], vec![4], 1).unwrap();
        let store = Arc::new(MemChunkStore::new(grid.clone()));
        store.insert(ChunkKey(0), vec![1u8; 3]);
        store.insert(ChunkKey(1), vec![1u8; 4]);
        let cache = Arc::new(ChunkCache::new(1024));
        let engine = PrefetchEngine::new(
            cache.clone(),
            store,
            EngineCaps {
                chunk_nbytes: Some(grid.chunk_nbytes()),
                ..caps(1, 8)
            },
        );
        engine.enqueue([ChunkKey(0), ChunkKey(1)]);
        engine.start().unwrap();
        // One worker, so key 0 is done before key 1 lands.
        assert!(wait_until(Duration::from_secs(5), || cache.contains(ChunkKey(1))));
        assert!(!cache.contains(ChunkKey(0)));
        let stats = engine.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.prefetched, 1);
    }

    struct PanicsOn {
        key: ChunkKey,
        calls: AtomicU64,
        inner: MemChunkStore,
    }

    impl ChunkStore for PanicsOn {
        fn fetch(&self, key: ChunkKey) -> Result<Payload, FetchError> {
            if key == self.key {
                self.calls.fetch_add(1, Ordering::SeqCst);
                panic!("store bug on {key}");
            }
            self.inner.fetch(key)
        }
    }

    #[test]
    fn panicking_fetch_releases_its_inflight_slot() {
        let grid = ChunkGrid::new(vec![16], vec![4], 1).unwrap();
        let store = Arc::new(PanicsOn {
            key: ChunkKey(0),
            calls: AtomicU64::new(0),
            inner: MemChunkStore::synthetic(grid),
        });
        let cache = Arc::new(ChunkCache::new(1024));
        let engine = PrefetchEngine::new(cache.clone(), store.clone(), caps(2, 8));
        engine.enqueue([ChunkKey(0)]);
        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            store.calls.load(Ordering::SeqCst) == 1 && engine.stats().inflight == 0
        }));

        // The surviving worker still serves the queue.
        engine.enqueue([ChunkKey(1)]);
        assert!(wait_until(Duration::from_secs(5), || cache.contains(ChunkKey(1))));
        assert!(!cache.contains(ChunkKey(0)));
    }
}
