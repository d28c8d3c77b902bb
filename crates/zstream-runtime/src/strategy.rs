use std::collections::VecDeque;

use zstream_core::{ChunkKey, PrefetchMethod, StreamConfig};

/// Rolling window of the most recent distinct chunk accesses, oldest first.
///
/// Consecutive repeats of the same key collapse into one observation: reading several
/// rows out of one chunk is a single step in the chunk-level access pattern.
#[derive(Debug, Clone)]
pub struct AccessHistory {
    keys: VecDeque<ChunkKey>,
    capacity: usize,
}

impl AccessHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            keys: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false when `key` repeats the latest observation and was not recorded.
    pub fn record(&mut self, key: ChunkKey) -> bool {
        if self.latest() == Some(key) {
            return false;
        }
        if self.keys.len() == self.capacity {
            self.keys.pop_front();
        }
        self.keys.push_back(key);
        true
    }

    pub fn latest(&self) -> Option<ChunkKey> {
        self.keys.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = ChunkKey> + '_ {
        self.keys.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<ChunkKey> for AccessHistory {
    /// History sized to hold exactly the collected keys.
    fn from_iter<I: IntoIterator<Item = ChunkKey>>(iter: I) -> Self {
        let keys: Vec<ChunkKey> = iter.into_iter().collect();
        let mut history = AccessHistory::new(keys.len());
        for key in keys {
            history.record(key);
        }
        history
    }
}

/// Predicts which chunks will be read next. Pure: no I/O, no interior state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchStrategy {
    /// The `lookahead` keys following the observed one.
    Sequential { lookahead: usize },
    /// Extrapolate the access stride once it has held for `min_stable_transitions`
    /// consecutive transitions; otherwise behave like `Sequential`.
    Pattern {
        lookahead: usize,
        min_stable_transitions: usize,
    },
}

impl PrefetchStrategy {
    pub fn from_config(cfg: &StreamConfig) -> Self {
        match cfg.prefetch_strategy {
            PrefetchMethod::Sequential => PrefetchStrategy::Sequential {
                lookahead: cfg.prefetch_lookahead,
            },
            PrefetchMethod::Pattern => PrefetchStrategy::Pattern {
                lookahead: cfg.prefetch_lookahead,
                min_stable_transitions: cfg.pattern_min_stable_transitions,
            },
        }
    }

    pub fn method(&self) -> PrefetchMethod {
        match self {
            PrefetchStrategy::Sequential { .. } => PrefetchMethod::Sequential,
            PrefetchStrategy::Pattern { .. } => PrefetchMethod::Pattern,
        }
    }

    pub fn lookahead(&self) -> usize {
        match self {
            PrefetchStrategy::Sequential { lookahead }
            | PrefetchStrategy::Pattern { lookahead, .. } => *lookahead,
        }
    }

    /// Keys likely to follow `observed`, nearest first.
    ///
    /// `history` holds the accesses before `observed` (a trailing copy of `observed`
    /// is ignored). Predictions never leave `[0, num_chunks)`; the sequence is cut
    /// at the first key that would.
    pub fn predict(
        &self,
        observed: ChunkKey,
        history: &AccessHistory,
        num_chunks: u64,
    ) -> Vec<ChunkKey> {
        let stride = match self {
            PrefetchStrategy::Sequential { .. } => 1,
            PrefetchStrategy::Pattern {
                min_stable_transitions,
                ..
            } => stable_stride(observed, history, *min_stable_transitions).unwrap_or(1),
        };
        extrapolate(observed, stride, self.lookahead(), num_chunks)
    }
}

/// The stride shared by the last `min_transitions` transitions ending at `observed`,
/// if it is the same nonzero value for all of them.
pub fn stable_stride(
    observed: ChunkKey,
    history: &AccessHistory,
    min_transitions: usize,
) -> Option<i64> {
    let min_transitions = min_transitions.max(1);
    let mut trail: Vec<i64> = history.iter().map(|k| k.0 as i64).collect();
    if history.latest() != Some(observed) {
        trail.push(observed.0 as i64);
    }
    if trail.len() < min_transitions + 1 {
        return None;
    }

    let tail = &trail[trail.len() - (min_transitions + 1)..];
    let stride = tail[1] - tail[0];
    if stride == 0 {
        return None;
    }
    tail.windows(2)
        .all(|w| w[1] - w[0] == stride)
        .then_some(stride)
}

fn extrapolate(observed: ChunkKey, stride: i64, lookahead: usize, num_chunks: u64) -> Vec<ChunkKey> {
    let mut out = Vec::with_capacity(lookahead);
    let mut current = observed;
    for _ in 0..lookahead {
        match current.offset(stride) {
            Some(next) if next.0 < num_chunks => {
                out.push(next);
                current = next;
            }
            _ => break,
        }
    }
    out
}
