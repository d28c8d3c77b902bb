#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod grid;
pub mod types;

pub use config::{ConfigError, PrefetchMethod, StreamConfig};
pub use grid::{ChunkGrid, MetadataError};
pub use types::{ChunkKey, Payload};
