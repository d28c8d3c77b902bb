use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchMethod {
    /// Next `lookahead` keys in index order.
    Sequential,
    /// Extrapolate a stable access stride, falling back to sequential.
    Pattern,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown prefetch strategy {0:?} (expected 'sequential' or 'pattern')")]
pub struct UnknownPrefetchMethod(pub String);

impl FromStr for PrefetchMethod {
    type Err = UnknownPrefetchMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(PrefetchMethod::Sequential),
            "pattern" => Ok(PrefetchMethod::Pattern),
            _ => Err(UnknownPrefetchMethod(s.to_string())),
        }
    }
}

impl fmt::Display for PrefetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefetchMethod::Sequential => write!(f, "sequential"),
            PrefetchMethod::Pattern => write!(f, "pattern"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("prefetch_lookahead must be > 0")]
    ZeroLookahead,
    #[error("worker_count must be > 0")]
    ZeroWorkers,
    #[error("prefetch_queue_capacity must be > 0")]
    ZeroQueueCapacity,
    #[error("prefetch_poll_interval_ms must be > 0")]
    ZeroPollInterval,
    #[error("pattern_min_stable_transitions must be > 0")]
    ZeroStableTransitions,
    #[error("pattern_history {history} too short; need at least {required} observations")]
    PatternHistoryTooShort { history: usize, required: usize },
    #[error("min_batch_size must be >= 1")]
    ZeroMinBatchSize,
    #[error("min_batch_size {min} exceeds max_batch_size {max}")]
    BatchBounds { min: usize, max: usize },
    #[error("batch_adjustment_factor must satisfy 0 < f < 1, got {0}")]
    AdjustmentFactor(f64),
    #[error("target_batch_time must be a finite number of seconds > 0, got {0}")]
    TargetBatchTime(f64),
    #[error("batch_time_tolerance must satisfy 0 <= t < 1, got {0}")]
    Tolerance(f64),
    #[error("monitoring_window must be > 0")]
    ZeroMonitoringWindow,
}

/// Options consumed by the cache, prefetch engine and batch controller.
///
/// Loading these from files, flags or the environment is the caller's concern; the
/// runtime only ever sees a validated `StreamConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub cache_capacity_bytes: u64,

    pub prefetch_enabled: bool,
    pub prefetch_strategy: PrefetchMethod,
    pub prefetch_lookahead: usize,
    pub worker_count: usize,
    pub prefetch_queue_capacity: usize,
    pub prefetch_poll_interval_ms: u64,
    pub pattern_history: usize,
    pub pattern_min_stable_transitions: usize,

    pub adaptive_batching: bool,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub batch_adjustment_factor: f64,
    /// Seconds.
    pub target_batch_time: f64,
    pub batch_time_tolerance: f64,
    pub monitoring_window: usize,

    pub shuffle: bool,
    pub seed: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: 2 << 30,
            prefetch_enabled: true,
            prefetch_strategy: PrefetchMethod::Pattern,
            prefetch_lookahead: 3,
            worker_count: 1,
            prefetch_queue_capacity: 1024,
            prefetch_poll_interval_ms: 100,
            pattern_history: 8,
            pattern_min_stable_transitions: 2,
            adaptive_batching: true,
            batch_size: 32,
            min_batch_size: 1,
            max_batch_size: 128,
            batch_adjustment_factor: 0.8,
            target_batch_time: 0.1,
            batch_time_tolerance: 0.1,
            monitoring_window: 5,
            shuffle: false,
            seed: 0,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch_lookahead == 0 {
            return Err(ConfigError::ZeroLookahead);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.prefetch_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.prefetch_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.pattern_min_stable_transitions == 0 {
            return Err(ConfigError::ZeroStableTransitions);
        }
        // n stable transitions need n + 1 observations.
        let required = self.pattern_min_stable_transitions.saturating_add(1);
        if self.pattern_history < required {
            return Err(ConfigError::PatternHistoryTooShort {
                history: self.pattern_history,
                required,
            });
        }
        if self.min_batch_size == 0 {
            return Err(ConfigError::ZeroMinBatchSize);
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(ConfigError::BatchBounds {
                min: self.min_batch_size,
                max: self.max_batch_size,
            });
        }
        let f = self.batch_adjustment_factor;
        if !(f > 0.0 && f < 1.0) {
            return Err(ConfigError::AdjustmentFactor(f));
        }
        let t = self.target_batch_time;
        if !(t.is_finite() && t > 0.0) {
            return Err(ConfigError::TargetBatchTime(t));
        }
        let tol = self.batch_time_tolerance;
        if !(0.0..1.0).contains(&tol) {
            return Err(ConfigError::Tolerance(tol));
        }
        if self.monitoring_window == 0 {
            return Err(ConfigError::ZeroMonitoringWindow);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.prefetch_poll_interval_ms)
    }

    /// Initial batch size clamped into `[min_batch_size, max_batch_size]`.
    pub fn initial_batch_size(&self) -> usize {
        self.batch_size
            .clamp(self.min_batch_size, self.max_batch_size.max(self.min_batch_size))
    }
}
