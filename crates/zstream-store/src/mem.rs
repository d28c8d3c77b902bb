use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use zstream_core::{ChunkGrid, ChunkKey, Payload};
use zstream_observe::metrics::Counter;

use crate::{ChunkStore, FetchError};

/// Which fetches an in-memory store should fail with a transient error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FailureMode {
    #[default]
    Never,
    Always,
    Keys(HashSet<ChunkKey>),
}

impl FailureMode {
    fn fails(&self, key: ChunkKey) -> bool {
        match self {
            FailureMode::Never => false,
            FailureMode::Always => true,
            FailureMode::Keys(keys) => keys.contains(&key),
        }
    }
}

/// In-process chunk store with optional latency and fault injection.
///
/// Chunks come from explicit [`MemChunkStore::insert`] calls or, for a synthetic store,
/// are generated on demand: every element holds its row-major flat index in the logical
/// array, little-endian, truncated or zero-padded to the element size. Padding outside
/// the array bounds is zero.
pub struct MemChunkStore {
    grid: ChunkGrid,
    synthetic: bool,
    latency: Duration,
    chunks: RwLock<HashMap<ChunkKey, Payload>>,
    failure: RwLock<FailureMode>,
    fetches: RwLock<HashMap<ChunkKey, u64>>,
    fetch_total: Counter,
}

impl MemChunkStore {
    /// Empty store; every fetch is `NotFound` until chunks are inserted.
    pub fn new(grid: ChunkGrid) -> Self {
        Self {
            grid,
            synthetic: false,
            latency: Duration::ZERO,
            chunks: RwLock::new(HashMap::new()),
            failure: RwLock::new(FailureMode::Never),
            fetches: RwLock::new(HashMap::new()),
            fetch_total: Counter::default(),
        }
    }

    pub fn synthetic(grid: ChunkGrid) -> Self {
        Self {
            synthetic: true,
            ..Self::new(grid)
        }
    }

    /// Every fetch sleeps for `latency` first, standing in for a network round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failure(self, mode: FailureMode) -> Self {
        *self.failure.write() = mode;
        self
    }

    pub fn set_failure(&self, mode: FailureMode) {
        *self.failure.write() = mode;
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    pub fn insert(&self, key: ChunkKey, bytes: impl Into<Payload>) {
        self.chunks.write().insert(key, bytes.into());
    }

    /// Total fetch calls, including failed ones.
    pub fn fetch_total(&self) -> u64 {
        self.fetch_total.get()
    }

    /// Fetch calls for one key, including failed ones.
    pub fn fetch_count(&self, key: ChunkKey) -> u64 {
        self.fetches.read().get(&key).copied().unwrap_or(0)
    }

    fn generate(&self, key: ChunkKey) -> Option<Payload> {
        let coord = self.grid.coord_of(key)?;
        let shape = self.grid.shape();
        let chunk_shape = self.grid.chunk_shape();
        let elem = self.grid.element_size();
        let rank = self.grid.rank();

        let per_chunk: u64 = chunk_shape.iter().product();
        let mut out = Vec::with_capacity(self.grid.chunk_nbytes() as usize);
        let mut local = vec![0u64; rank];
        for _ in 0..per_chunk {
            let mut flat = 0u64;
            let mut inside = true;
            for axis in 0..rank {
                let global = coord[axis] * chunk_shape[axis] + local[axis];
                if global >= shape[axis] {
                    inside = false;
                    break;
                }
                flat = flat * shape[axis] + global;
            }
            if inside {
                out.extend_from_slice(&encode_element(flat, elem));
            } else {
                out.extend(std::iter::repeat_n(0u8, elem));
            }

            // Advance the in-chunk coordinate, last axis fastest.
            for axis in (0..rank).rev() {
                local[axis] += 1;
                if local[axis] < chunk_shape[axis] {
                    break;
                }
                local[axis] = 0;
            }
        }
        Some(Arc::from(out))
    }
}

/// Synthetic element encoding: `value` little-endian, truncated or zero-padded to `element_size`.
pub fn encode_element(value: u64, element_size: usize) -> Vec<u8> {
    let le = value.to_le_bytes();
    let mut out = vec![0u8; element_size];
    let n = element_size.min(le.len());
    out[..n].copy_from_slice(&le[..n]);
    out
}

impl ChunkStore for MemChunkStore {
    fn fetch(&self, key: ChunkKey) -> Result<Payload, FetchError> {
        self.fetch_total.inc();
        *self.fetches.write().entry(key).or_insert(0) += 1;

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if self.failure.read().fails(key) {
            return Err(FetchError::transient(key, "injected failure"));
        }
        if let Some(bytes) = self.chunks.read().get(&key) {
            return Ok(bytes.clone());
        }
        if self.synthetic {
            return self.generate(key).ok_or(FetchError::NotFound { key });
        }
        Err(FetchError::NotFound { key })
    }
}
