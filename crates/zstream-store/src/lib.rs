#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;
pub mod http;
pub mod mem;
#[cfg(feature = "s3")]
pub mod s3;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use zstream_core::{ChunkGrid, ChunkKey, Payload};

pub use fs::FsChunkStore;
pub use http::HttpChunkStore;
pub use mem::{FailureMode, MemChunkStore};
#[cfg(feature = "s3")]
pub use s3::S3ChunkStore;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The key does not exist in the dataset.
    #[error("chunk {key} not found")]
    NotFound { key: ChunkKey },
    /// Network or storage failure; a later fetch of the same key may succeed.
    #[error("fetch of chunk {key} failed: {source}")]
    Transient {
        key: ChunkKey,
        #[source]
        source: BoxError,
    },
}

impl FetchError {
    pub fn key(&self) -> ChunkKey {
        match self {
            FetchError::NotFound { key } | FetchError::Transient { key, .. } => *key,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }

    pub fn transient(key: ChunkKey, source: impl Into<BoxError>) -> Self {
        FetchError::Transient {
            key,
            source: source.into(),
        }
    }
}

/// Synchronous key → bytes fetch against wherever the chunks live.
///
/// Implementations own their timeout and retry policy. `fetch` is called from plain
/// OS threads (prefetch workers) and from the consumer thread on a cache miss.
pub trait ChunkStore: Send + Sync + 'static {
    fn fetch(&self, key: ChunkKey) -> Result<Payload, FetchError>;
}

impl<S: ChunkStore + ?Sized> ChunkStore for Arc<S> {
    fn fetch(&self, key: ChunkKey) -> Result<Payload, FetchError> {
        (**self).fetch(key)
    }
}

/// A store plus the array metadata it was opened with.
pub struct OpenedStore {
    pub store: Arc<dyn ChunkStore>,
    pub grid: ChunkGrid,
}

/// Opens a zarr v2 array by location.
///
/// - `s3://bucket/prefix` (requires feature `s3`)
/// - `http://...` / `https://...`
/// - anything else is a local directory
pub fn open(location: &str) -> Result<OpenedStore> {
    if let Some(rest) = location.strip_prefix("s3://") {
        #[cfg(not(feature = "s3"))]
        {
            let _ = rest;
            anyhow::bail!("s3 support not enabled (rebuild zstream-store with --features s3)");
        }
        #[cfg(feature = "s3")]
        {
            let store = S3ChunkStore::open(rest)?;
            let grid = store.grid().clone();
            return Ok(OpenedStore {
                store: Arc::new(store),
                grid,
            });
        }
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        let store = HttpChunkStore::open(location)?;
        let grid = store.grid().clone();
        return Ok(OpenedStore {
            store: Arc::new(store),
            grid,
        });
    }
    let store = FsChunkStore::open(location)?;
    let grid = store.grid().clone();
    Ok(OpenedStore {
        store: Arc::new(store),
        grid,
    })
}

/// Path of `key` relative to the array root, or `NotFound` when the key is outside the grid.
pub(crate) fn chunk_path(grid: &ChunkGrid, key: ChunkKey) -> Result<String, FetchError> {
    grid.chunk_path(key).ok_or(FetchError::NotFound { key })
}

pub(crate) fn check_chunk_len(
    grid: &ChunkGrid,
    key: ChunkKey,
    len: usize,
) -> Result<(), FetchError> {
    check_payload_len(key, len, grid.chunk_nbytes())
}

/// Rejects a payload whose length is not the encoded chunk size, as a transient failure.
pub fn check_payload_len(key: ChunkKey, len: usize, expected: u64) -> Result<(), FetchError> {
    if len as u64 != expected {
        return Err(FetchError::transient(
            key,
            format!("chunk has {len} bytes, expected {expected}"),
        ));
    }
    Ok(())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let suffix = format!(
        "tmp.{}.{}",
        std::process::id(),
        zstream_observe::time::unix_time_ms()
    );
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    tmp.set_file_name(format!("{file_name}.{suffix}"));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Drives async client calls (reqwest, aws-sdk) from the synchronous `fetch` path.
///
/// Owns a small multi-threaded runtime so pooled connections keep being serviced
/// between calls. When invoked from inside another tokio runtime the call is moved
/// off the async worker with `block_in_place`, and dropping never blocks, so a store
/// may be released from async code.
pub(crate) struct BlockingRuntime {
    rt: Option<tokio::runtime::Runtime>,
    handle: tokio::runtime::Handle,
}

impl BlockingRuntime {
    pub(crate) fn new(name: &str) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(name)
            .enable_all()
            .build()?;
        let handle = rt.handle().clone();
        Ok(Self {
            rt: Some(rt),
            handle,
        })
    }

    pub(crate) fn block_on<Fut: Future>(&self, fut: Fut) -> Fut::Output {
        match tokio::runtime::Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.handle.block_on(fut)),
            Err(_) => self.handle.block_on(fut),
        }
    }
}

impl Drop for BlockingRuntime {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

/// Exponential backoff with jitter shared by the network stores.
pub(crate) struct Backoff {
    attempt: usize,
    delay_ms: u64,
    max_attempts: usize,
    seed: u64,
}

impl Backoff {
    const BASE_DELAY_MS: u64 = 50;
    const MAX_DELAY_MS: u64 = 1000;

    pub(crate) fn new(max_attempts: usize, key: ChunkKey) -> Self {
        Self {
            attempt: 1,
            delay_ms: Self::BASE_DELAY_MS,
            max_attempts,
            seed: key.0,
        }
    }

    pub(crate) fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub(crate) async fn wait(&mut self) {
        let jitter = zstream_observe::time::unix_time_ms().wrapping_add(self.seed) % 37;
        tokio::time::sleep(std::time::Duration::from_millis(
            self.delay_ms.saturating_add(jitter),
        ))
        .await;
        self.delay_ms = (self.delay_ms.saturating_mul(2)).min(Self::MAX_DELAY_MS);
        self.attempt = self.attempt.saturating_add(1);
    }
}
