use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;

use zstream_core::{ChunkGrid, ChunkKey, Payload, StreamConfig};
use zstream_observe::metrics::{Counter, DurationAgg, DurationAggSnapshot, ScopedTimer};
use zstream_store::{check_payload_len, ChunkStore, FetchError};

use crate::cache::{CacheStats, ChunkCache};
use crate::engine::{EngineCaps, PrefetchEngine, PrefetchStats};
use crate::strategy::{AccessHistory, PrefetchStrategy};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("chunk {key} not found")]
    NotFound { key: ChunkKey },
    #[error("fetch of chunk {key} failed")]
    FetchFailed {
        key: ChunkKey,
        #[source]
        source: FetchError,
    },
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: u64, len: u64 },
    #[error("row {index} needs {bytes} bytes, which cannot be allocated")]
    RowTooLarge { index: u64, bytes: u64 },
}

impl DatasetError {
    fn from_fetch(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { key } => DatasetError::NotFound { key },
            other => DatasetError::FetchFailed {
                key: other.key(),
                source: other,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct DatasetMetrics {
    pub chunk_requests_total: Counter,
    pub item_requests_total: Counter,
    pub sync_fetches_total: Counter,
    pub sync_fetch_failures_total: Counter,
    pub sync_fetch_latency: DurationAgg,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DatasetStats {
    pub chunk_requests: u64,
    pub item_requests: u64,
    pub sync_fetches: u64,
    pub sync_fetch_failures: u64,
    pub sync_fetch_latency: DurationAggSnapshot,
    pub cache: CacheStats,
    /// `None` when prefetching is disabled.
    pub prefetch: Option<PrefetchStats>,
}

/// Applied to every item returned by [`Dataset::get_item`].
pub type ItemTransform = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Cache-first access to a chunked array.
///
/// A miss is fetched synchronously on the caller's thread; every access is reported to
/// the prefetch strategy and the predicted keys that are not cached yet go to the
/// engine. The engine starts with the dataset and stops when it is dropped.
pub struct Dataset {
    grid: ChunkGrid,
    store: Arc<dyn ChunkStore>,
    cache: Arc<ChunkCache>,
    engine: Option<PrefetchEngine>,
    strategy: PrefetchStrategy,
    history: Mutex<AccessHistory>,
    transform: Option<ItemTransform>,
    metrics: DatasetMetrics,
}

impl Dataset {
    pub fn new(store: Arc<dyn ChunkStore>, grid: ChunkGrid, cfg: &StreamConfig) -> Result<Self> {
        cfg.validate()?;
        let cache = Arc::new(ChunkCache::new(cfg.cache_capacity_bytes));
        let engine = if cfg.prefetch_enabled {
            let caps = EngineCaps {
                chunk_nbytes: Some(grid.chunk_nbytes()),
                ..EngineCaps::from(cfg)
            };
            let engine = PrefetchEngine::new(cache.clone(), store.clone(), caps);
            engine.start()?;
            Some(engine)
        } else {
            None
        };

        tracing::info!(
            target: "zstream",
            event = "dataset_opened",
            shape = ?grid.shape(),
            chunks = ?grid.chunk_shape(),
            num_chunks = grid.num_chunks(),
            cache_capacity_bytes = cfg.cache_capacity_bytes,
            prefetch = cfg.prefetch_enabled,
            strategy = %cfg.prefetch_strategy,
            "dataset ready"
        );

        Ok(Self {
            grid,
            store,
            cache,
            engine,
            strategy: PrefetchStrategy::from_config(cfg),
            history: Mutex::new(AccessHistory::new(cfg.pattern_history)),
            transform: None,
            metrics: DatasetMetrics::default(),
        })
    }

    /// Runs `f` over each assembled row before [`Dataset::get_item`] returns it.
    pub fn with_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Opens `location` with [`zstream_store::open`].
    pub fn open(location: &str, cfg: &StreamConfig) -> Result<Self> {
        let opened = zstream_store::open(location)?;
        Self::new(opened.store, opened.grid, cfg)
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    /// Number of logical items (rows along axis 0).
    pub fn len(&self) -> u64 {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn prefetch_engine(&self) -> Option<&PrefetchEngine> {
        self.engine.as_ref()
    }

    pub fn strategy(&self) -> &PrefetchStrategy {
        &self.strategy
    }

    /// Bytes of one chunk, from the cache or a synchronous fetch.
    pub fn get_chunk(&self, key: ChunkKey) -> Result<Payload, DatasetError> {
        self.metrics.chunk_requests_total.inc();
        if !self.grid.contains(key) {
            return Err(DatasetError::NotFound { key });
        }
        let payload = match self.cache.get(key) {
            Some(payload) => payload,
            None => self.fetch_sync(key)?,
        };
        self.observe(key);
        Ok(payload)
    }

    /// Row-major bytes of logical row `index` along axis 0, passed through the transform if set.
    pub fn get_item(&self, index: u64) -> Result<Vec<u8>, DatasetError> {
        self.metrics.item_requests_total.inc();
        let len = self.grid.len();
        if index >= len {
            return Err(DatasetError::IndexOutOfRange { index, len });
        }

        let mut out = alloc_row(index, self.grid.item_nbytes())?;
        let row = index % self.grid.chunk_shape()[0];
        for key in self.grid.keys_for_index(index) {
            let chunk = self.get_chunk(key)?;
            let coord = self
                .grid
                .coord_of(key)
                .ok_or(DatasetError::NotFound { key })?;
            copy_row(&self.grid, &coord, &chunk, row, &mut out);
        }
        Ok(match &self.transform {
            Some(f) => f(out),
            None => out,
        })
    }

    pub fn metrics(&self) -> &DatasetMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            chunk_requests: self.metrics.chunk_requests_total.get(),
            item_requests: self.metrics.item_requests_total.get(),
            sync_fetches: self.metrics.sync_fetches_total.get(),
            sync_fetch_failures: self.metrics.sync_fetch_failures_total.get(),
            sync_fetch_latency: self.metrics.sync_fetch_latency.snapshot(),
            cache: self.cache.stats(),
            prefetch: self.engine.as_ref().map(PrefetchEngine::stats),
        }
    }

    fn fetch_sync(&self, key: ChunkKey) -> Result<Payload, DatasetError> {
        self.metrics.sync_fetches_total.inc();
        let fetched = {
            let _timer = ScopedTimer::new(&self.metrics.sync_fetch_latency);
            self.store.fetch(key)
        };

        let payload = fetched
            .and_then(|payload| {
                check_payload_len(key, payload.len(), self.grid.chunk_nbytes()).map(|()| payload)
            })
            .map_err(|err| {
                self.metrics.sync_fetch_failures_total.inc();
                DatasetError::from_fetch(err)
            })?;
        if let Err(err) = self.cache.put(key, payload.clone()) {
            tracing::warn!(
                target: "zstream",
                event = "cache_reject",
                key = %key,
                error = %err,
                "chunk larger than cache; serving uncached"
            );
        }
        Ok(payload)
    }

    /// Reports an access to the strategy and queues the predicted misses.
    fn observe(&self, key: ChunkKey) {
        let Some(engine) = &self.engine else {
            return;
        };
        let predicted = {
            let mut history = self.history.lock();
            if history.latest() == Some(key) {
                return;
            }
            let predicted = self
                .strategy
                .predict(key, &history, self.grid.num_chunks());
            history.record(key);
            predicted
        };
        engine.enqueue(predicted.into_iter().filter(|k| !self.cache.contains(*k)));
    }
}

/// Zeroed buffer for one row; metadata can describe rows larger than memory.
fn alloc_row(index: u64, bytes: u64) -> Result<Vec<u8>, DatasetError> {
    let too_large = || DatasetError::RowTooLarge { index, bytes };
    let len = usize::try_from(bytes).map_err(|_| too_large())?;
    let mut out = Vec::new();
    out.try_reserve_exact(len).map_err(|_| too_large())?;
    out.resize(len, 0);
    Ok(out)
}

/// Copies row `row` of one chunk into the matching slots of `out`, a full logical row.
///
/// Skips the chunk's edge padding beyond the array bounds.
fn copy_row(grid: &ChunkGrid, coord: &[u64], chunk: &[u8], row: u64, out: &mut [u8]) {
    let elem = grid.element_size();
    let shape = &grid.shape()[1..];
    let chunk_shape = &grid.chunk_shape()[1..];
    let rank = shape.len();

    let row_elems: u64 = chunk_shape.iter().product();
    let row_base = row * row_elems;
    if rank == 0 {
        let src = row_base as usize * elem;
        if let (Some(dst), Some(src)) = (out.get_mut(..elem), chunk.get(src..src + elem)) {
            dst.copy_from_slice(src);
        }
        return;
    }

    let origin: Vec<u64> = (0..rank).map(|a| coord[a + 1] * chunk_shape[a]).collect();
    let extent: Vec<u64> = (0..rank)
        .map(|a| chunk_shape[a].min(shape[a] - origin[a]))
        .collect();
    let chunk_strides = strides(chunk_shape);
    let out_strides = strides(shape);

    let run_bytes = extent[rank - 1] as usize * elem;
    let mut local = vec![0u64; rank];
    loop {
        let src_elem: u64 = row_base
            + (0..rank)
                .map(|a| local[a] * chunk_strides[a])
                .sum::<u64>();
        let dst_elem: u64 = (0..rank)
            .map(|a| (origin[a] + local[a]) * out_strides[a])
            .sum();
        let src = src_elem as usize * elem;
        let dst = dst_elem as usize * elem;
        if let (Some(d), Some(s)) = (
            out.get_mut(dst..dst + run_bytes),
            chunk.get(src..src + run_bytes),
        ) {
            d.copy_from_slice(s);
        }

        // Next run: advance every axis but the last, last-but-one fastest.
        let mut axis = rank - 1;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            local[axis] += 1;
            if local[axis] < extent[axis] {
                break;
            }
            local[axis] = 0;
        }
    }
}

/// Row-major element strides for `shape`.
fn strides(shape: &[u64]) -> Vec<u64> {
    let mut out = vec![1u64; shape.len()];
    for a in (0..shape.len().saturating_sub(1)).rev() {
        out[a] = out[a + 1] * shape[a + 1];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use zstream_store::mem::encode_element;
    use zstream_store::{FailureMode, MemChunkStore};

    fn no_prefetch() -> StreamConfig {
        StreamConfig {
            prefetch_enabled: false,
            ..StreamConfig::default()
        }
    }

    fn synthetic(shape: &[u64], chunks: &[u64], elem: usize) -> (Arc<MemChunkStore>, ChunkGrid) {
        let grid = ChunkGrid::new(shape.to_vec(), chunks.to_vec(), elem).unwrap();
        (Arc::new(MemChunkStore::synthetic(grid.clone())), grid)
    }

    fn expected_row(first: u64, n: u64, elem: usize) -> Vec<u8> {
        (first..first + n).flat_map(|v| encode_element(v, elem)).collect()
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(strides(&[4, 3, 5]), vec![15, 5, 1]);
        assert_eq!(strides(&[7]), vec![1]);
    }

    #[test]
    fn get_item_stitches_edge_chunks() {
        let (store, grid) = synthetic(&[3, 5], &[2, 2], 1);
        let ds = Dataset::new(store, grid, &no_prefetch()).unwrap();
        assert_eq!(ds.get_item(2).unwrap(), expected_row(10, 5, 1));
        assert_eq!(ds.get_item(1).unwrap(), expected_row(5, 5, 1));
    }

    #[test]
    fn get_item_handles_rank_three() {
        let (store, grid) = synthetic(&[4, 3, 5], &[2, 2, 2], 2);
        let ds = Dataset::new(store, grid, &no_prefetch()).unwrap();
        assert_eq!(ds.get_item(3).unwrap(), expected_row(45, 15, 2));
        assert_eq!(ds.get_item(0).unwrap(), expected_row(0, 15, 2));
    }

    #[test]
    fn get_item_handles_rank_one() {
        let (store, grid) = synthetic(&[10], &[4], 2);
        let ds = Dataset::new(store, grid, &no_prefetch()).unwrap();
        assert_eq!(ds.get_item(9).unwrap(), encode_element(9, 2));
    }

    #[test]
    fn out_of_range_index_is_reported() {
        let (store, grid) = synthetic(&[3, 5], &[2, 2], 1);
        let ds = Dataset::new(store, grid, &no_prefetch()).unwrap();
        assert!(matches!(
            ds.get_item(3),
            Err(DatasetError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn second_read_is_a_cache_hit() {
        let (store, grid) = synthetic(&[8, 4], &[2, 4], 1);
        let ds = Dataset::new(store.clone(), grid, &no_prefetch()).unwrap();
        ds.get_chunk(ChunkKey(1)).unwrap();
        ds.get_chunk(ChunkKey(1)).unwrap();
        assert_eq!(store.fetch_count(ChunkKey(1)), 1);
        let stats = ds.stats();
        assert_eq!(stats.sync_fetches, 1);
        assert_eq!(stats.cache.hits, 1);
        assert!(stats.prefetch.is_none());
    }

    #[test]
    fn not_found_is_distinct_from_fetch_failure() {
        let (store, grid) = synthetic(&[8], &[2], 1);
        store.set_failure(FailureMode::Keys([ChunkKey(1)].into_iter().collect()));
        let ds = Dataset::new(store, grid, &no_prefetch()).unwrap();
        assert!(matches!(
            ds.get_chunk(ChunkKey(9)),
            Err(DatasetError::NotFound { key: ChunkKey(9) })
        ));
        assert!(matches!(
            ds.get_chunk(ChunkKey(1)),
            Err(DatasetError::FetchFailed { key: ChunkKey(1), .. })
        ));
        assert_eq!(ds.stats().sync_fetch_failures, 1);
    }

    #[test]
    fn chunk_larger_than_cache_is_still_served() {
        let (store, grid) = synthetic(&[8, 4], &[2, 4], 1);
        let cfg = StreamConfig {
            cache_capacity_bytes: 4,
            ..no_prefetch()
        };
        let ds = Dataset::new(store, grid, &cfg).unwrap();
        let bytes = ds.get_chunk(ChunkKey(0)).unwrap();
        assert_eq!(bytes.len(), 8);
        assert!(ds.cache().is_empty());
        assert_eq!(ds.stats().cache.rejected, 1);
    }

    #[test]
    fn invalid_config_is_rejected_before_start() {
        let (store, grid) = synthetic(&[8], &[2], 1);
        let cfg = StreamConfig {
            min_batch_size: 9,
            max_batch_size: 3,
            ..StreamConfig::default()
        };
        assert!(Dataset::new(store, grid, &cfg).is_err());
    }

    #[test]
    fn wrong_sized_chunk_is_an_error_and_not_cached() {
        let grid = ChunkGrid::new(vec![4, 4], vec![2, 4], 1).unwrap();
        let store = Arc::new(MemChunkStore::new(grid.clone()));
        store.insert(ChunkKey(0), vec![7u8; 3]);
        let ds = Dataset::new(store, grid, &no_prefetch()).unwrap();
        assert!(matches!(
            ds.get_item(1),
            Err(DatasetError::FetchFailed { key: ChunkKey(0), .. })
        ));
        assert!(!ds.cache().contains(ChunkKey(0)));
        assert_eq!(ds.stats().sync_fetch_failures, 1);
    }

    #[test]
    fn unallocatable_row_is_an_error() {
        let (store, grid) = synthetic(&[2, 1 << 62], &[1, 1 << 62], 1);
        let ds = Dataset::new(store.clone(), grid, &no_prefetch()).unwrap();
        assert!(matches!(
            ds.get_item(0),
            Err(DatasetError::RowTooLarge { index: 0, .. })
        ));
        assert_eq!(store.fetch_total(), 0);
    }

    #[test]
    fn transform_applies_to_every_item() {
        let (store, grid) = synthetic(&[3, 5], &[2, 2], 1);
        let ds = Dataset::new(store, grid, &no_prefetch())
            .unwrap()
            .with_transform(|row| row.into_iter().rev().collect());
        let mut expected = expected_row(10, 5, 1);
        expected.reverse();
        assert_eq!(ds.get_item(2).unwrap(), expected);
        // Chunks themselves are untouched.
        assert_eq!(&ds.get_chunk(ChunkKey(0)).unwrap()[..], &[0, 1, 5, 6]);
    }
}
