use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Immutable chunk bytes.
///
/// Cloning is a refcount bump, so handing a payload out of the cache never exposes
/// the cache's own bookkeeping to the caller.
pub type Payload = Arc<[u8]>;

/// Identifies one chunk of the logical array.
///
/// The value is the row-major (C-order) ordinal of the chunk's grid coordinate, so
/// key order is index order: `ChunkKey(n + 1)` is the chunk after `ChunkKey(n)`.
/// Use [`crate::ChunkGrid::key_of`] / [`crate::ChunkGrid::coord_of`] to convert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkKey(pub u64);

impl ChunkKey {
    pub fn ordinal(self) -> u64 {
        self.0
    }

    /// Key `delta` positions away in index order, or `None` below zero / on overflow.
    pub fn offset(self, delta: i64) -> Option<ChunkKey> {
        self.0.checked_add_signed(delta).map(ChunkKey)
    }
}

impl From<u64> for ChunkKey {
    fn from(value: u64) -> Self {
        ChunkKey(value)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
