use serde::Deserialize;
use thiserror::Error;

use crate::types::ChunkKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("array must have at least one dimension")]
    EmptyShape,
    #[error("shape has rank {shape} but chunk shape has rank {chunks}")]
    RankMismatch { shape: usize, chunks: usize },
    #[error("{field}[{axis}] must be > 0")]
    NonPositiveExtent { field: &'static str, axis: usize },
    #[error("element size must be > 0")]
    ZeroElementSize,
    #[error("chunk grid too large (chunk count overflows u64)")]
    Overflow,
    #[error("invalid .zarray document: {0}")]
    Json(String),
    #[error("unsupported dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("unsupported array layout: {0}")]
    Unsupported(String),
}

/// Shape and chunking of one logical array; the deterministic index → [`ChunkKey`] mapping.
///
/// Invariants (checked in [`ChunkGrid::new`]):
/// - `shape` and `chunk_shape` have the same non-zero rank
/// - every extent is > 0
/// - the total chunk count fits in a `u64`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    shape: Vec<u64>,
    chunk_shape: Vec<u64>,
    element_size: usize,
    grid_shape: Vec<u64>,
    num_chunks: u64,
}

impl ChunkGrid {
    pub fn new(
        shape: Vec<u64>,
        chunk_shape: Vec<u64>,
        element_size: usize,
    ) -> Result<Self, MetadataError> {
        if shape.is_empty() {
            return Err(MetadataError::EmptyShape);
        }
        if shape.len() != chunk_shape.len() {
            return Err(MetadataError::RankMismatch {
                shape: shape.len(),
                chunks: chunk_shape.len(),
            });
        }
        if element_size == 0 {
            return Err(MetadataError::ZeroElementSize);
        }
        for (axis, (&extent, &chunk)) in shape.iter().zip(chunk_shape.iter()).enumerate() {
            if extent == 0 {
                return Err(MetadataError::NonPositiveExtent {
                    field: "shape",
                    axis,
                });
            }
            if chunk == 0 {
                return Err(MetadataError::NonPositiveExtent {
                    field: "chunks",
                    axis,
                });
            }
        }

        let grid_shape: Vec<u64> = shape
            .iter()
            .zip(chunk_shape.iter())
            .map(|(&extent, &chunk)| extent.div_ceil(chunk))
            .collect();
        let num_chunks = grid_shape
            .iter()
            .try_fold(1u64, |acc, &n| acc.checked_mul(n))
            .ok_or(MetadataError::Overflow)?;

        Ok(Self {
            shape,
            chunk_shape,
            element_size,
            grid_shape,
            num_chunks,
        })
    }

    /// Parses a zarr v2 `.zarray` document.
    ///
    /// Only uncompressed, unfiltered, C-order arrays with a simple dtype are accepted;
    /// decoding codecs belongs to the store layer, not the chunk grid.
    pub fn from_zarray_json(bytes: &[u8]) -> Result<Self, MetadataError> {
        let doc: ZArray =
            serde_json::from_slice(bytes).map_err(|e| MetadataError::Json(e.to_string()))?;

        if let Some(fmt) = doc.zarr_format {
            if fmt != 2 {
                return Err(MetadataError::Unsupported(format!("zarr_format {fmt}")));
            }
        }
        if doc.compressor.as_ref().is_some_and(|c| !c.is_null()) {
            return Err(MetadataError::Unsupported("compressed chunks".to_string()));
        }
        if doc
            .filters
            .as_ref()
            .is_some_and(|f| !f.is_null() && f.as_array().map_or(true, |a| !a.is_empty()))
        {
            return Err(MetadataError::Unsupported("filters".to_string()));
        }
        if let Some(order) = doc.order.as_deref() {
            if order != "C" {
                return Err(MetadataError::Unsupported(format!("order {order:?}")));
            }
        }

        let element_size = dtype_element_size(&doc.dtype)?;
        Self::new(doc.shape, doc.chunks, element_size)
    }

    /// Uncompressed zarr v2 metadata for this grid. Elements are typed as raw `|V<n>`.
    pub fn to_zarray_json(&self) -> Vec<u8> {
        let doc = serde_json::json!({
            "zarr_format": 2,
            "shape": self.shape,
            "chunks": self.chunk_shape,
            "dtype": format!("|V{}", self.element_size),
            "compressor": null,
            "fill_value": null,
            "filters": null,
            "order": "C",
        });
        doc.to_string().into_bytes()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of chunks along each axis.
    pub fn grid_shape(&self) -> &[u64] {
        &self.grid_shape
    }

    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// Extent along axis 0, i.e. the number of logical items.
    pub fn len(&self) -> u64 {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: ChunkKey) -> bool {
        key.0 < self.num_chunks
    }

    pub fn key_of(&self, coord: &[u64]) -> Option<ChunkKey> {
        if coord.len() != self.rank() {
            return None;
        }
        let mut ordinal = 0u64;
        for (&c, &n) in coord.iter().zip(self.grid_shape.iter()) {
            if c >= n {
                return None;
            }
            // Cannot overflow: the result is < num_chunks.
            ordinal = ordinal * n + c;
        }
        Some(ChunkKey(ordinal))
    }

    pub fn coord_of(&self, key: ChunkKey) -> Option<Vec<u64>> {
        if !self.contains(key) {
            return None;
        }
        let mut rest = key.0;
        let mut coord = vec![0u64; self.rank()];
        for (slot, &n) in coord.iter_mut().zip(self.grid_shape.iter()).rev() {
            *slot = rest % n;
            rest /= n;
        }
        Some(coord)
    }

    /// Zarr v2 chunk path, e.g. `"0.3.1"`.
    pub fn chunk_path(&self, key: ChunkKey) -> Option<String> {
        let coord = self.coord_of(key)?;
        let parts: Vec<String> = coord.iter().map(|c| c.to_string()).collect();
        Some(parts.join("."))
    }

    /// Encoded size of one chunk. Edge chunks are stored padded to the full chunk shape.
    pub fn chunk_nbytes(&self) -> u64 {
        self.chunk_shape
            .iter()
            .fold(self.element_size as u64, |acc, &n| acc.saturating_mul(n))
    }

    /// Size of one logical item (a row along axis 0).
    pub fn item_nbytes(&self) -> u64 {
        self.shape[1..]
            .iter()
            .fold(self.element_size as u64, |acc, &n| acc.saturating_mul(n))
    }

    /// Every chunk covering logical row `index` along axis 0, ascending.
    ///
    /// Row-major ordinals make these a contiguous key range.
    pub fn keys_for_index(&self, index: u64) -> Vec<ChunkKey> {
        if index >= self.len() {
            return Vec::new();
        }
        let per_row: u64 = self.grid_shape[1..].iter().product();
        let first = (index / self.chunk_shape[0]) * per_row;
        (first..first + per_row).map(ChunkKey).collect()
    }
}

#[derive(Debug, Deserialize)]
struct ZArray {
    #[serde(default)]
    zarr_format: Option<u32>,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    dtype: String,
    #[serde(default)]
    compressor: Option<serde_json::Value>,
    #[serde(default)]
    filters: Option<serde_json::Value>,
    #[serde(default)]
    order: Option<String>,
}

/// Element size of a numpy typestr such as `<f4`, `|u1` or `>i8`.
fn dtype_element_size(dtype: &str) -> Result<usize, MetadataError> {
    let unsupported = || MetadataError::UnsupportedDtype(dtype.to_string());
    let body = dtype
        .strip_prefix(['<', '>', '|'])
        .ok_or_else(unsupported)?;
    let mut chars = body.chars();
    let kind = chars.next().ok_or_else(unsupported)?;
    if !matches!(kind, 'b' | 'i' | 'u' | 'f' | 'c' | 'V') {
        return Err(unsupported());
    }
    let size: usize = chars.as_str().parse().map_err(|_| unsupported())?;
    if size == 0 {
        return Err(unsupported());
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_sizes() {
        assert_eq!(dtype_element_size("<f4"), Ok(4));
        assert_eq!(dtype_element_size("|u1"), Ok(1));
        assert_eq!(dtype_element_size(">c16"), Ok(16));
        assert!(dtype_element_size("f4").is_err());
        assert_eq!(dtype_element_size("|V12"), Ok(12));
        assert!(dtype_element_size("<U8").is_err());
        assert!(dtype_element_size("<i0").is_err());
    }

    #[test]
    fn coord_roundtrip_is_row_major() {
        let grid = ChunkGrid::new(vec![10, 7], vec![4, 3], 4).unwrap();
        assert_eq!(grid.grid_shape(), &[3, 3]);
        assert_eq!(grid.key_of(&[1, 2]), Some(ChunkKey(5)));
        assert_eq!(grid.coord_of(ChunkKey(5)), Some(vec![1, 2]));
        assert_eq!(grid.key_of(&[3, 0]), None);
        assert_eq!(grid.coord_of(ChunkKey(9)), None);
    }
}
