//! Process-local cache of template binaries, keyed by content-version id.
//! Keys are content-addressed and immutable, so no distributed coherence is
//! needed: a second `put` of an existing key is a no-op, and an entry is
//! never replaced. Eviction is strict LRU over total resident bytes.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_bytes: u64,
    pub entries: u64,
}

struct Inner {
    entries: lru::LruCache<String, Bytes>,
    resident_bytes: u64,
}

pub struct TemplateCache {
    max_bytes: u64,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TemplateCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(Inner {
                // Capacity is governed by bytes, not entry count.
                entries: lru::LruCache::unbounded(),
                resident_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetches an entry, bumping its recency.
    pub fn get(&self, id: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(id) {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(bytes.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Admits an entry, evicting least-recently-used entries until it fits.
    /// An entry larger than the cap is still admitted and stands alone.
    /// Putting an existing key is a no-op: the binary behind a
    /// content-version id never changes.
    pub fn put(&self, id: &str, bytes: Bytes) {
        let incoming = bytes.len() as u64;
        let mut inner = self.inner.lock().unwrap();

        if inner.entries.contains(id) {
            return;
        }

        while inner.resident_bytes + incoming > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((evicted_id, evicted)) => {
                    inner.resident_bytes -= evicted.len() as u64;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(id = %evicted_id, bytes = evicted.len(), "evicted template");
                }
                None => break, // Oversized entry; admit it alone.
            }
        }

        inner.resident_bytes += incoming;
        inner.entries.put(id.to_string(), bytes);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident_bytes: inner.resident_bytes,
            entries: inner.entries.len() as u64,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_hit_miss_and_recency() {
        let cache = TemplateCache::new(100);
        assert!(cache.get("a").is_none());
        cache.put("a", bytes_of(10, 1));
        assert_eq!(cache.get("a").unwrap().len(), 10);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.resident_bytes, 10);
    }

    #[test]
    fn test_strict_lru_eviction_order() {
        let cache = TemplateCache::new(30);
        cache.put("a", bytes_of(10, 1));
        cache.put("b", bytes_of(10, 2));
        cache.put("c", bytes_of(10, 3));

        // Touch "a" so "b" is now least recently used.
        cache.get("a");
        cache.put("d", bytes_of(10, 4));

        assert!(cache.get("b").is_none(), "b was least recently used");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_evicts_until_fit() {
        let cache = TemplateCache::new(30);
        cache.put("a", bytes_of(10, 1));
        cache.put("b", bytes_of(10, 2));
        cache.put("c", bytes_of(10, 3));
        cache.put("big", bytes_of(15, 4));

        let stats = cache.stats();
        assert_eq!(stats.entries, 2, "a and b evicted to admit big");
        assert_eq!(stats.resident_bytes, 10 + 15);
        assert!(cache.get("c").is_some());
        assert!(cache.get("big").is_some());
    }

    #[test]
    fn test_entry_at_exactly_the_cap() {
        let cache = TemplateCache::new(30);
        cache.put("a", bytes_of(10, 1));
        cache.put("exact", bytes_of(30, 2));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1, "exact-cap entry is the sole resident");
        assert_eq!(stats.resident_bytes, 30);
        assert!(cache.get("exact").is_some());
    }

    #[test]
    fn test_oversized_entry_admitted_alone() {
        let cache = TemplateCache::new(30);
        cache.put("a", bytes_of(10, 1));
        cache.put("huge", bytes_of(50, 2));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.resident_bytes, 50);
        assert!(cache.get("huge").is_some());
    }

    #[test]
    fn test_put_existing_key_is_noop() {
        let cache = TemplateCache::new(100);
        cache.put("a", bytes_of(10, 1));
        cache.put("a", bytes_of(20, 2));

        assert_eq!(cache.get("a").unwrap().len(), 10);
        assert_eq!(cache.stats().resident_bytes, 10);
    }
}
