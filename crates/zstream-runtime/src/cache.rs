use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use thiserror::Error;

use zstream_core::{ChunkKey, Payload};
use zstream_observe::metrics::Counter;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("chunk {key} ({size} bytes) exceeds cache capacity of {capacity} bytes")]
    CapacityExceeded {
        key: ChunkKey,
        size: u64,
        capacity: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected: u64,
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

impl CacheStats {
    /// Fraction of `get` calls that hit, or 0 before any lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits.saturating_add(self.misses);
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    payload: Payload,
    size: u64,
    /// Position in `Inner::recency`; strictly increasing across touches and inserts.
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ChunkKey, Entry>,
    /// tick -> key, oldest first.
    recency: BTreeMap<u64, ChunkKey>,
    used_bytes: u64,
    next_tick: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick = self.next_tick.wrapping_add(1);
        tick
    }

    fn remove(&mut self, key: ChunkKey) -> Option<Entry> {
        let entry = self.entries.remove(&key)?;
        self.recency.remove(&entry.tick);
        self.used_bytes = self.used_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<ChunkKey> {
        let (_, key) = self.recency.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.used_bytes = self.used_bytes.saturating_sub(entry.size);
        }
        Some(key)
    }
}

/// Byte-bounded chunk cache with strict LRU eviction.
///
/// One mutex guards the entry map and recency index; it is only ever held for
/// in-memory work. Payloads are handed out as `Arc` clones, so readers never
/// hold a reference into the map.
pub struct ChunkCache {
    capacity_bytes: u64,
    inner: Mutex<Inner>,
    hits: Counter,
    misses: Counter,
    evictions: Counter,
    rejected: Counter,
}

impl ChunkCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            inner: Mutex::new(Inner::default()),
            hits: Counter::default(),
            misses: Counter::default(),
            evictions: Counter::default(),
            rejected: Counter::default(),
        }
    }

    /// Looks up `key`, marking it most recently used on a hit.
    pub fn get(&self, key: ChunkKey) -> Option<Payload> {
        let mut inner = self.inner.lock();
        let tick = inner.bump();
        let Some(entry) = inner.entries.get_mut(&key) else {
            drop(inner);
            self.misses.inc();
            return None;
        };
        let old_tick = entry.tick;
        entry.tick = tick;
        let payload = entry.payload.clone();
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, key);
        drop(inner);

        self.hits.inc();
        Some(payload)
    }

    /// Inserts or replaces `key`, evicting least-recently-used entries until it fits.
    ///
    /// A payload larger than the whole cache is rejected and leaves the cache untouched,
    /// including any existing entry for `key`.
    pub fn put(&self, key: ChunkKey, payload: Payload) -> Result<(), CacheError> {
        let size = payload.len() as u64;
        if size > self.capacity_bytes {
            self.rejected.inc();
            return Err(CacheError::CapacityExceeded {
                key,
                size,
                capacity: self.capacity_bytes,
            });
        }

        let mut evicted = 0u64;
        {
            let mut inner = self.inner.lock();
            inner.remove(key);
            while inner.used_bytes.saturating_add(size) > self.capacity_bytes {
                if inner.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
            let tick = inner.bump();
            inner.recency.insert(tick, key);
            inner.entries.insert(
                key,
                Entry {
                    payload,
                    size,
                    tick,
                },
            );
            inner.used_bytes = inner.used_bytes.saturating_add(size);
        }

        if evicted > 0 {
            self.evictions.inc_by(evicted);
        }
        Ok(())
    }

    /// Membership check that leaves recency and hit/miss counters alone.
    pub fn contains(&self, key: ChunkKey) -> bool {
        self.inner.lock().entries.contains_key(&key)
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<ChunkKey> {
        self.inner.lock().recency.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, used_bytes) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.used_bytes)
        };
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            evictions: self.evictions.get(),
            rejected: self.rejected.get(),
            entries,
            used_bytes,
            capacity_bytes: self.capacity_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bytes(n: usize, fill: u8) -> Payload {
        Arc::from(vec![fill; n])
    }

    #[test]
    fn put_then_get_returns_same_bytes() {
        let cache = ChunkCache::new(100);
        cache.put(ChunkKey(1), bytes(10, 7)).unwrap();
        let got = cache.get(ChunkKey(1)).unwrap();
        assert_eq!(&got[..], &[7u8; 10]);
        assert_eq!(cache.stats().hits, 1);
        assert!(cache.get(ChunkKey(2)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn reinsert_does_not_double_count() {
        let cache = ChunkCache::new(100);
        cache.put(ChunkKey(1), bytes(40, 1)).unwrap();
        cache.put(ChunkKey(1), bytes(30, 2)).unwrap();
        assert_eq!(cache.used_bytes(), 30);
        assert_eq!(cache.len(), 1);
        assert_eq!(&cache.get(ChunkKey(1)).unwrap()[..], &[2u8; 30]);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = ChunkCache::new(30);
        cache.put(ChunkKey(1), bytes(10, 1)).unwrap();
        cache.put(ChunkKey(2), bytes(10, 2)).unwrap();
        cache.put(ChunkKey(3), bytes(10, 3)).unwrap();
        // Touch 1 so 2 becomes the oldest.
        assert!(cache.get(ChunkKey(1)).is_some());
        cache.put(ChunkKey(4), bytes(10, 4)).unwrap();

        assert!(!cache.contains(ChunkKey(2)));
        assert_eq!(
            cache.keys_by_recency(),
            vec![ChunkKey(3), ChunkKey(1), ChunkKey(4)]
        );
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn oversized_payload_is_rejected_without_side_effects() {
        let cache = ChunkCache::new(16);
        cache.put(ChunkKey(1), bytes(8, 1)).unwrap();
        let err = cache.put(ChunkKey(1), bytes(17, 2)).unwrap_err();
        assert_eq!(
            err,
            CacheError::CapacityExceeded {
                key: ChunkKey(1),
                size: 17,
                capacity: 16
            }
        );
        assert_eq!(&cache.get(ChunkKey(1)).unwrap()[..], &[1u8; 8]);
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn contains_does_not_touch_recency() {
        let cache = ChunkCache::new(20);
        cache.put(ChunkKey(1), bytes(10, 1)).unwrap();
        cache.put(ChunkKey(2), bytes(10, 2)).unwrap();
        assert!(cache.contains(ChunkKey(1)));
        cache.put(ChunkKey(3), bytes(10, 3)).unwrap();
        assert!(!cache.contains(ChunkKey(1)));
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn zero_capacity_accepts_only_empty_payloads() {
        let cache = ChunkCache::new(0);
        assert!(cache.put(ChunkKey(1), bytes(1, 0)).is_err());
        cache.put(ChunkKey(2), bytes(0, 0)).unwrap();
        assert!(cache.contains(ChunkKey(2)));
    }

    #[test]
    fn hit_rate_counts_hits_over_lookups() {
        let cache = ChunkCache::new(10);
        assert_eq!(cache.stats().hit_rate(), 0.0);
        cache.put(ChunkKey(1), bytes(1, 1)).unwrap();
        cache.get(ChunkKey(1));
        cache.get(ChunkKey(1));
        cache.get(ChunkKey(1));
        cache.get(ChunkKey(9));
        assert!((cache.stats().hit_rate() - 0.75).abs() < 1e-9);
    }
}
