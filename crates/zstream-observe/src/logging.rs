use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `ZSTREAM_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for zstream components:
/// - Structured events use `target: "zstream"` and carry an `event` field naming what happened.
/// - Include `key` on any event about a single chunk.
/// - Include `batch_size` on any event emitted by the batch controller or loader.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = env_filter();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("ZSTREAM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
