//! Bounded in-memory backend (spec §4.7) with TTL / LRU / LFU eviction.
//! Entries are lazily expired on access and swept periodically by a
//! background task, mirroring the teacher's use of `tokio::spawn` for
//! maintenance loops (e.g. `session_pool.rs`'s health-check loop).
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::backend::{glob_match, BackendStats, CacheBackend, EvictionStrategy};
use crate::error::Error;

struct Entry {
    value: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
    last_access: Instant,
    hit_count: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl != Duration::ZERO && now.duration_since(self.created_at) >= self.ttl
    }
}

struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    max_size: usize,
    strategy: EvictionStrategy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Thread/task-safe bounded in-memory cache.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(max_size: usize, strategy: EvictionStrategy) -> Self {
        let backend = Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                max_size,
                strategy,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        };
        backend.spawn_sweeper(Duration::from_secs(30));
        backend
    }

    /// No-ops outside a Tokio runtime (e.g. constructed in a plain `#[test]`)
    /// instead of panicking; the backend still works, just without the
    /// periodic sweep, since entries are also lazily expired on access.
    fn spawn_sweeper(&self, interval: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { return };
                let now = Instant::now();
                let mut entries = shared.entries.lock();
                entries.retain(|_, e| !e.is_expired(now));
            }
        });
    }

    fn evict_if_needed(&self, entries: &mut HashMap<String, Entry>) {
        if entries.len() <= self.shared.max_size {
            return;
        }
        let victim = match self.shared.strategy {
            EvictionStrategy::Ttl => entries
                .iter()
                .min_by_key(|(_, e)| e.created_at + e.ttl)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::Lru => entries.iter().min_by_key(|(_, e)| e.last_access).map(|(k, _)| k.clone()),
            EvictionStrategy::Lfu => entries.iter().min_by_key(|(_, e)| e.hit_count).map(|(k, _)| k.clone()),
        };
        if let Some(key) = victim {
            entries.remove(&key);
            self.shared.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let now = Instant::now();
        let mut entries = self.shared.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired(now) {
                entries.remove(key);
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            entry.last_access = now;
            entry.hit_count += 1;
            self.shared.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.value.clone()));
        }
        self.shared.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let now = Instant::now();
        let mut entries = self.shared.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                ttl,
                last_access: now,
                hit_count: 0,
            },
        );
        self.evict_if_needed(&mut entries);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.shared.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, Error> {
        let mut entries = self.shared.entries.lock();
        let matching: Vec<String> = entries.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
        for key in &matching {
            entries.remove(key);
        }
        Ok(matching.len() as u64)
    }

    async fn clear(&self) -> Result<(), Error> {
        self.shared.entries.lock().clear();
        Ok(())
    }

    async fn stats(&self) -> BackendStats {
        BackendStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            size: self.shared.entries.lock().len() as u64,
            evictions: self.shared.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_zero_never_expires() {
        let backend = MemoryBackend::new(10, EvictionStrategy::Lru);
        backend.set("k", b"v".to_vec(), Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let backend = MemoryBackend::new(10, EvictionStrategy::Lru);
        backend.set("k", b"v".to_vec(), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let backend = MemoryBackend::new(2, EvictionStrategy::Lru);
        backend.set("a", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();
        backend.set("b", b"2".to_vec(), Duration::from_secs(60)).await.unwrap();
        backend.get("a").await.unwrap();
        backend.set("c", b"3".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("b").await.unwrap(), None);
        assert!(backend.get("a").await.unwrap().is_some());
        assert!(backend.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_pattern_removes_matching_keys_only() {
        let backend = MemoryBackend::new(10, EvictionStrategy::Lru);
        backend.set("odoo:res.partner:1", b"a".to_vec(), Duration::from_secs(60)).await.unwrap();
        backend.set("odoo:res.partner:2", b"b".to_vec(), Duration::from_secs(60)).await.unwrap();
        backend.set("odoo:res.country:1", b"c".to_vec(), Duration::from_secs(60)).await.unwrap();
        let removed = backend.delete_pattern("odoo:res.partner:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(backend.get("odoo:res.country:1").await.unwrap().is_some());
    }
}
