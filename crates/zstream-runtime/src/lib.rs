#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod cache;
pub mod controller;
pub mod dataset;
pub mod engine;
pub mod loader;
pub mod sink;
pub mod strategy;
pub mod types;

pub use cache::{CacheError, CacheStats, ChunkCache};
pub use controller::AdaptiveBatchController;
pub use dataset::{Dataset, DatasetError, DatasetStats};
pub use engine::{EngineCaps, PrefetchEngine, PrefetchStats, PrefetchTask};
pub use loader::AdaptiveLoader;
pub use sink::Sink;
pub use strategy::{AccessHistory, PrefetchStrategy};
pub use types::Batch;
