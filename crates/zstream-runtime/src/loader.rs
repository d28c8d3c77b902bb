use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use zstream_core::StreamConfig;
use zstream_observe::metrics::Counter;

use crate::controller::AdaptiveBatchController;
use crate::dataset::{Dataset, DatasetError};
use crate::sink::Sink;
use crate::types::{Batch, BatchBuilder};

#[derive(Debug, Default)]
pub struct LoaderMetrics {
    pub delivered_batches_total: Counter,
    pub delivered_samples_total: Counter,
    pub delivered_bytes_total: Counter,
}

/// One pass over a [`Dataset`] in batches sized by an [`AdaptiveBatchController`].
///
/// The time fed to the controller for a batch runs from the previous hand-out to this
/// one, so it covers whatever the consumer did in between as well as the reads.
pub struct AdaptiveLoader {
    dataset: Arc<Dataset>,
    controller: AdaptiveBatchController,
    order: Vec<u64>,
    cursor: usize,
    last_handout: Option<Instant>,
    metrics: Arc<LoaderMetrics>,
}

impl AdaptiveLoader {
    pub fn new(dataset: Arc<Dataset>, cfg: &StreamConfig) -> Result<Self> {
        let controller = AdaptiveBatchController::new(cfg)?;
        let mut order: Vec<u64> = (0..dataset.len()).collect();
        if cfg.shuffle {
            let mut rng = StdRng::seed_from_u64(cfg.seed);
            order.shuffle(&mut rng);
        }
        Ok(Self {
            dataset,
            controller,
            order,
            cursor: 0,
            last_handout: None,
            metrics: Arc::new(LoaderMetrics::default()),
        })
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn controller(&self) -> &AdaptiveBatchController {
        &self.controller
    }

    /// Size of the next batch.
    pub fn current_batch_size(&self) -> usize {
        self.controller.current_batch_size()
    }

    /// Items not yet handed out.
    pub fn remaining(&self) -> usize {
        self.order.len() - self.cursor
    }

    /// Delivery counters; the handle stays readable after the loader moves to another thread.
    pub fn metrics(&self) -> &Arc<LoaderMetrics> {
        &self.metrics
    }

    /// Assembles the next batch; `None` once every item has been handed out.
    ///
    /// A failed read consumes the batch it belonged to, so iteration always advances.
    pub fn next_batch(&mut self) -> Option<Result<Batch, DatasetError>> {
        let fetch_started = Instant::now();
        let size = self.controller.current_batch_size();
        let end = self.cursor.saturating_add(size).min(self.order.len());
        if self.cursor >= end {
            return None;
        }
        let ids = &self.order[self.cursor..end];
        self.cursor = end;

        let item_bytes = self.dataset.grid().item_nbytes() as usize;
        let mut builder = BatchBuilder::with_capacity(ids.len(), ids.len() * item_bytes);
        for &index in ids {
            match self.dataset.get_item(index) {
                Ok(bytes) => builder.push(index, &bytes),
                Err(err) => {
                    self.last_handout = None;
                    return Some(Err(err));
                }
            }
        }
        let batch = builder.finish();

        let now = Instant::now();
        let since = self.last_handout.unwrap_or(fetch_started);
        let next = self
            .controller
            .record(batch.sample_count(), now.duration_since(since));
        self.last_handout = Some(now);

        self.metrics.delivered_batches_total.inc();
        self.metrics
            .delivered_samples_total
            .inc_by(batch.sample_count() as u64);
        self.metrics
            .delivered_bytes_total
            .inc_by(batch.payload_len() as u64);
        tracing::trace!(
            target: "zstream",
            event = "batch_ready",
            batch_size = batch.sample_count(),
            next_batch_size = next,
            "batch ready"
        );
        Some(Ok(batch))
    }

    /// Delivers every remaining batch to `sink`, returning the number of samples.
    pub fn drain_into(&mut self, sink: &dyn Sink) -> Result<u64> {
        let mut samples = 0u64;
        while let Some(batch) = self.next_batch() {
            let batch = batch?;
            samples += batch.sample_count() as u64;
            sink.deliver(batch)?;
        }
        Ok(samples)
    }
}

impl Iterator for AdaptiveLoader {
    type Item = Result<Batch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
