use std::collections::VecDeque;
use std::time::Duration;

use zstream_core::{ConfigError, StreamConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
struct BatchSample {
    batch_size: usize,
    elapsed: Duration,
}

/// Closed-loop batch sizing: multiplicative decrease when batches run slow,
/// multiplicative increase when they run fast.
///
/// Once the window holds `monitoring_window` samples, every new sample re-estimates the
/// per-item service time over the window and projects it onto the current size. A
/// projection outside `target * (1 ± tolerance)` moves the size by `factor` (or its
/// inverse), by at least one, clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchController {
    enabled: bool,
    current: usize,
    min: usize,
    max: usize,
    factor: f64,
    target_secs: f64,
    tolerance: f64,
    window: VecDeque<BatchSample>,
    window_len: usize,
    adjustments: u64,
}

impl AdaptiveBatchController {
    pub fn new(cfg: &StreamConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            enabled: cfg.adaptive_batching,
            current: cfg.initial_batch_size(),
            min: cfg.min_batch_size,
            max: cfg.max_batch_size,
            factor: cfg.batch_adjustment_factor,
            target_secs: cfg.target_batch_time,
            tolerance: cfg.batch_time_tolerance,
            window: VecDeque::with_capacity(cfg.monitoring_window),
            window_len: cfg.monitoring_window,
            adjustments: 0,
        })
    }

    pub fn current_batch_size(&self) -> usize {
        self.current
    }

    /// How many times the size has changed.
    pub fn adjustments(&self) -> u64 {
        self.adjustments
    }

    /// Mean seconds per item over the window.
    pub fn per_item_secs(&self) -> Option<f64> {
        let items: usize = self.window.iter().map(|s| s.batch_size).sum();
        if items == 0 {
            return None;
        }
        let secs: f64 = self.window.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        Some(secs / items as f64)
    }

    /// Feeds one observed batch and returns the size to request next.
    pub fn record(&mut self, batch_size: usize, elapsed: Duration) -> usize {
        if !self.enabled || batch_size == 0 {
            return self.current;
        }
        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(BatchSample {
            batch_size,
            elapsed,
        });
        if self.window.len() < self.window_len {
            return self.current;
        }

        let Some(per_item) = self.per_item_secs() else {
            return self.current;
        };
        let next = self.next_size(per_item);
        if next != self.current {
            tracing::debug!(
                target: "zstream",
                event = "batch_resized",
                batch_size = next,
                previous_batch_size = self.current,
                per_item_us = (per_item * 1e6) as u64,
                "adjusted batch size"
            );
            self.current = next;
            self.adjustments += 1;
        }
        self.current
    }

    fn next_size(&self, per_item_secs: f64) -> usize {
        let current = self.current as f64;
        let projected = per_item_secs * current;
        let upper = self.target_secs * (1.0 + self.tolerance);
        let lower = self.target_secs * (1.0 - self.tolerance);

        let proposed = if projected > upper {
            let shrunk = (current * self.factor).round() as usize;
            shrunk.min(self.current.saturating_sub(1))
        } else if projected < lower {
            let grown = (current / self.factor).round() as usize;
            grown.max(self.current.saturating_add(1))
        } else {
            return self.current;
        };
        proposed.clamp(self.min, self.max).max(1)
    }
}
