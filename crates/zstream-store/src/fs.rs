use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use zstream_core::{ChunkGrid, ChunkKey, Payload};

use crate::{check_chunk_len, chunk_path, write_atomic, ChunkStore, FetchError};

const ZARRAY: &str = ".zarray";

/// Zarr v2 directory store: `<root>/.zarray` plus one file per chunk named `i.j.k`.
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
    grid: ChunkGrid,
}

impl FsChunkStore {
    /// Opens an existing array, reading its `.zarray`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta_path = root.join(ZARRAY);
        let bytes = std::fs::read(&meta_path)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", meta_path.display()))?;
        let grid = ChunkGrid::from_zarray_json(&bytes)?;
        Ok(Self { root, grid })
    }

    /// Creates (or overwrites) the array metadata at `root`. Chunks are written separately.
    pub fn create(root: impl Into<PathBuf>, grid: ChunkGrid) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        write_atomic(&root.join(ZARRAY), &grid.to_zarray_json())?;
        Ok(Self { root, grid })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    pub fn chunk_file(&self, key: ChunkKey) -> Option<PathBuf> {
        self.grid.chunk_path(key).map(|p| self.root.join(p))
    }

    pub fn write_chunk(&self, key: ChunkKey, bytes: &[u8]) -> Result<()> {
        let path = self
            .chunk_file(key)
            .ok_or_else(|| anyhow::anyhow!("chunk {key} outside grid"))?;
        anyhow::ensure!(
            bytes.len() as u64 == self.grid.chunk_nbytes(),
            "chunk {} has {} bytes, expected {}",
            key,
            bytes.len(),
            self.grid.chunk_nbytes()
        );
        write_atomic(&path, bytes)?;
        Ok(())
    }
}

impl ChunkStore for FsChunkStore {
    fn fetch(&self, key: ChunkKey) -> Result<Payload, FetchError> {
        let path = self.root.join(chunk_path(&self.grid, key)?);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound { key })
            }
            Err(err) => return Err(FetchError::transient(key, err)),
        };
        check_chunk_len(&self.grid, key, bytes.len())?;
        Ok(Arc::from(bytes))
    }
}
