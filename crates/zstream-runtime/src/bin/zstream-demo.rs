#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, info_span, warn, Instrument};

use zstream_core::{ChunkGrid, ChunkKey, PrefetchMethod, StreamConfig};
use zstream_observe::metrics::Gauge;
use zstream_runtime::loader::LoaderMetrics;
use zstream_runtime::{AdaptiveLoader, Batch, Dataset, Sink};
use zstream_store::{FailureMode, MemChunkStore};

#[derive(Debug, Parser)]
#[command(name = "zstream-demo")]
struct Args {
    /// Zarr v2 array to stream (`s3://`, `http(s)://` or a local directory).
    /// A synthetic in-memory array is used when unset.
    #[arg(long, env = "ZSTREAM_STORE")]
    store: Option<String>,

    /// Start from a JSON `StreamConfig`; flags below override individual fields.
    #[arg(long, env = "ZSTREAM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "ZSTREAM_SHAPE", default_value = "4096,256", value_delimiter = ',')]
    shape: Vec<u64>,

    #[arg(long, env = "ZSTREAM_CHUNKS", default_value = "64,256", value_delimiter = ',')]
    chunks: Vec<u64>,

    #[arg(long, env = "ZSTREAM_ELEMENT_SIZE", default_value_t = 4)]
    element_size: usize,

    /// Simulated per-fetch latency of the synthetic store.
    #[arg(long, env = "ZSTREAM_FETCH_LATENCY_MS", default_value_t = 20)]
    fetch_latency_ms: u64,

    /// Make every n-th synthetic chunk fail (0 disables).
    #[arg(long, env = "ZSTREAM_FAIL_EVERY", default_value_t = 0)]
    fail_every: u64,

    #[arg(long, env = "ZSTREAM_CACHE_CAPACITY_BYTES")]
    cache_capacity_bytes: Option<u64>,

    #[arg(long, env = "ZSTREAM_PREFETCH_STRATEGY")]
    prefetch_strategy: Option<PrefetchMethod>,

    #[arg(long, env = "ZSTREAM_PREFETCH_LOOKAHEAD")]
    prefetch_lookahead: Option<usize>,

    #[arg(long, env = "ZSTREAM_WORKER_COUNT")]
    worker_count: Option<usize>,

    #[arg(long, env = "ZSTREAM_NO_PREFETCH", default_value_t = false)]
    no_prefetch: bool,

    #[arg(long, env = "ZSTREAM_BATCH_SIZE")]
    batch_size: Option<usize>,

    #[arg(long, env = "ZSTREAM_MIN_BATCH_SIZE")]
    min_batch_size: Option<usize>,

    #[arg(long, env = "ZSTREAM_MAX_BATCH_SIZE")]
    max_batch_size: Option<usize>,

    /// Seconds.
    #[arg(long, env = "ZSTREAM_TARGET_BATCH_TIME")]
    target_batch_time: Option<f64>,

    #[arg(long, env = "ZSTREAM_NO_ADAPTIVE_BATCHING", default_value_t = false)]
    no_adaptive_batching: bool,

    #[arg(long, env = "ZSTREAM_SHUFFLE", default_value_t = false)]
    shuffle: bool,

    #[arg(long, env = "ZSTREAM_SEED")]
    seed: Option<u64>,

    /// Simulated consumer time per delivered batch.
    #[arg(long, env = "ZSTREAM_SINK_SLEEP_MS", default_value_t = 0)]
    sink_sleep_ms: u64,

    /// Periodically emit a metrics snapshot (0 disables).
    #[arg(long, env = "ZSTREAM_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 1000)]
    metrics_snapshot_interval_ms: u64,
}

impl Args {
    fn stream_config(&self) -> Result<StreamConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
                serde_json::from_slice::<StreamConfig>(&bytes)?
            }
            None => StreamConfig::default(),
        };
        if let Some(v) = self.cache_capacity_bytes {
            cfg.cache_capacity_bytes = v;
        }
        if let Some(v) = self.prefetch_strategy {
            cfg.prefetch_strategy = v;
        }
        if let Some(v) = self.prefetch_lookahead {
            cfg.prefetch_lookahead = v;
        }
        if let Some(v) = self.worker_count {
            cfg.worker_count = v;
        }
        if self.no_prefetch {
            cfg.prefetch_enabled = false;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.min_batch_size {
            cfg.min_batch_size = v;
        }
        if let Some(v) = self.max_batch_size {
            cfg.max_batch_size = v;
        }
        if let Some(v) = self.target_batch_time {
            cfg.target_batch_time = v;
        }
        if self.no_adaptive_batching {
            cfg.adaptive_batching = false;
        }
        if self.shuffle {
            cfg.shuffle = true;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn open_dataset(&self, cfg: &StreamConfig) -> Result<Dataset> {
        if let Some(location) = &self.store {
            return Dataset::open(location, cfg);
        }
        let grid = ChunkGrid::new(self.shape.clone(), self.chunks.clone(), self.element_size)?;
        let mut store = MemChunkStore::synthetic(grid.clone())
            .with_latency(Duration::from_millis(self.fetch_latency_ms));
        if self.fail_every > 0 {
            let failing: HashSet<ChunkKey> = (0..grid.num_chunks())
                .filter(|k| k % self.fail_every == 0)
                .map(ChunkKey)
                .collect();
            store = store.with_failure(FailureMode::Keys(failing));
        }
        Dataset::new(Arc::new(store), grid, cfg)
    }
}

struct SlowSink {
    sleep: Duration,
    last_batch_size: Gauge,
}

impl SlowSink {
    fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            last_batch_size: Gauge::default(),
        }
    }
}

impl Sink for SlowSink {
    fn deliver(&self, batch: Batch) -> Result<()> {
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        self.last_batch_size.set(batch.sample_count() as u64);
        Ok(())
    }
}

fn emit_metrics_snapshot(dataset: &Dataset, loader: &LoaderMetrics, sink: &SlowSink) {
    let stats = dataset.stats();
    let prefetch = stats.prefetch.unwrap_or_default();
    tracing::info!(
        target: "zstream_metrics",
        cache_hits = stats.cache.hits,
        cache_misses = stats.cache.misses,
        cache_hit_rate = stats.cache.hit_rate(),
        cache_evictions = stats.cache.evictions,
        cache_used_bytes = stats.cache.used_bytes,
        cache_entries = stats.cache.entries as u64,
        sync_fetches = stats.sync_fetches,
        sync_fetch_failures = stats.sync_fetch_failures,
        sync_fetch_avg_us = stats.sync_fetch_latency.avg().as_micros() as u64,
        prefetch_enqueued = prefetch.enqueued,
        prefetch_dropped_queue_full = prefetch.dropped_queue_full,
        prefetched = prefetch.prefetched,
        prefetch_failures = prefetch.failures,
        prefetch_pending = prefetch.pending as u64,
        prefetch_inflight = prefetch.inflight as u64,
        prefetch_fetch_avg_us = prefetch.fetch_latency.avg().as_micros() as u64,
        delivered_batches_total = loader.delivered_batches_total.get(),
        delivered_samples_total = loader.delivered_samples_total.get(),
        delivered_bytes_total = loader.delivered_bytes_total.get(),
        sink_last_batch_size = sink.last_batch_size.get(),
        "metrics"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    zstream_observe::logging::init_tracing();
    let args = Args::parse();
    let cfg = args.stream_config()?;

    let span = info_span!(
        "zstream-demo",
        store = args.store.as_deref().unwrap_or("synthetic"),
        prefetch = cfg.prefetch_enabled,
        strategy = %cfg.prefetch_strategy,
        lookahead = cfg.prefetch_lookahead,
        workers = cfg.worker_count,
        adaptive_batching = cfg.adaptive_batching,
        sink_sleep_ms = args.sink_sleep_ms,
    );

    async move {
        let dataset = Arc::new(args.open_dataset(&cfg)?);
        let sink = Arc::new(SlowSink::new(Duration::from_millis(args.sink_sleep_ms)));
        let mut loader = AdaptiveLoader::new(dataset.clone(), &cfg)?;
        let loader_metrics = loader.metrics().clone();

        let metrics_task = if args.metrics_snapshot_interval_ms > 0 {
            let interval_ms = std::cmp::max(1, args.metrics_snapshot_interval_ms);
            let dataset = dataset.clone();
            let loader_metrics = loader_metrics.clone();
            let sink = sink.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    emit_metrics_snapshot(&dataset, &loader_metrics, &sink);
                }
            }))
        } else {
            None
        };

        let start = Instant::now();
        info!(items = dataset.len(), "starting adaptive loader");

        let loader_sink = sink.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        // A plain thread so ctrl-c does not wait for the drain to finish.
        std::thread::Builder::new()
            .name("zstream-loader".to_string())
            .spawn(move || {
                let res = loader
                    .drain_into(loader_sink.as_ref())
                    .map(|delivered| (delivered, loader.current_batch_size()));
                let _ = done_tx.send(res);
            })?;

        let mut final_batch_size = None;
        tokio::select! {
            res = done_rx => {
                let (_, batch_size) = res??;
                final_batch_size = Some(batch_size);
            }
            _ = signal::ctrl_c() => {
                warn!("ctrl-c received; exiting");
            }
        }

        if let Some(task) = metrics_task {
            task.abort();
        }

        let elapsed = start.elapsed();
        emit_metrics_snapshot(&dataset, &loader_metrics, &sink);

        let delivered_samples = loader_metrics.delivered_samples_total.get();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            delivered_samples as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            delivered_samples = delivered_samples,
            final_batch_size = ?final_batch_size,
            cache_hit_rate = dataset.stats().cache.hit_rate(),
            samples_per_sec = throughput,
            "demo complete"
        );

        Ok(())
    }
    .instrument(span)
    .await
}
