//! Cache manager (spec §4.7): named backend registry, read-through API with
//! per-key request coalescing, write-invalidation hooks, and a fallback
//! chain from a primary backend to a secondary when the primary degrades.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::backend::{BackendStats, CacheBackend};
use crate::error::Error;
use crate::retry::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerSettings};

struct NamedBackend {
    backend: Arc<dyn CacheBackend>,
    secondary: Option<Arc<dyn CacheBackend>>,
    primary_circuit: CircuitBreaker,
}

/// Manager-wide registry plus per-key compute locks.
pub struct CacheManager {
    backends: SyncMutex<HashMap<String, NamedBackend>>,
    default_backend: SyncMutex<Option<String>>,
    key_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    default_ttl: Duration,
}

impl CacheManager {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            backends: SyncMutex::new(HashMap::new()),
            default_backend: SyncMutex::new(None),
            key_locks: SyncMutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Registers a named backend, optionally with a secondary fallback used
    /// once the primary's circuit opens.
    pub fn register(
        &self,
        name: impl Into<String>,
        backend: Arc<dyn CacheBackend>,
        secondary: Option<Arc<dyn CacheBackend>>,
        circuit_breaker_threshold: u32,
        recovery_timeout: Duration,
    ) {
        let name = name.into();
        let mut backends = self.backends.lock();
        let is_first = backends.is_empty();
        backends.insert(
            name.clone(),
            NamedBackend {
                backend,
                secondary,
                primary_circuit: CircuitBreaker::new(CircuitBreakerSettings {
                    failure_threshold: circuit_breaker_threshold,
                    recovery_timeout,
                    ..Default::default()
                }),
            },
        );
        if is_first {
            *self.default_backend.lock() = Some(name);
        }
    }

    pub fn set_default(&self, name: impl Into<String>) {
        *self.default_backend.lock() = Some(name.into());
    }

    fn resolve(&self, name: Option<&str>) -> Result<String, Error> {
        match name {
            Some(n) => Ok(n.to_string()),
            None => self.default_backend.lock().clone().ok_or_else(|| Error::CacheError {
                message: "no default cache backend registered".to_string(),
            }),
        }
    }

    fn active_backend(&self, name: &str) -> Result<(Arc<dyn CacheBackend>, Option<Arc<dyn CacheBackend>>, CircuitBreaker), Error> {
        let backends = self.backends.lock();
        let entry = backends.get(name).ok_or_else(|| Error::CacheError {
            message: format!("unknown cache backend {name}"),
        })?;
        Ok((entry.backend.clone(), entry.secondary.clone(), entry.primary_circuit.clone()))
    }

    /// A read that falls back to the secondary backend when the primary's
    /// circuit is open, per spec §4.7's fallback chain.
    async fn get_with_fallback(&self, name: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let (primary, secondary, circuit) = self.active_backend(name)?;
        match circuit.try_admit() {
            Admission::Rejected { .. } => {
                if let Some(secondary) = secondary {
                    return secondary.get(key).await;
                }
                return Err(Error::CacheConnectionError {
                    message: "primary cache circuit is open and no secondary is registered".to_string(),
                });
            }
            _ => {}
        }
        match primary.get(key).await {
            Ok(v) => {
                circuit.on_success();
                Ok(v)
            }
            Err(e) => {
                circuit.on_failure();
                if let Some(secondary) = secondary {
                    tracing::warn!(error = %e, "primary cache read failed, falling back to secondary");
                    secondary.get(key).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn set_with_fallback(&self, name: &str, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let (primary, secondary, circuit) = self.active_backend(name)?;
        let admitted = !matches!(circuit.try_admit(), Admission::Rejected { .. });
        if admitted {
            match primary.set(key, value.clone(), ttl).await {
                Ok(()) => {
                    circuit.on_success();
                    return Ok(());
                }
                Err(e) => {
                    circuit.on_failure();
                    if secondary.is_none() {
                        return Err(e);
                    }
                }
            }
        }
        match secondary {
            Some(secondary) => secondary.set(key, value, ttl).await,
            None => Err(Error::CacheConnectionError {
                message: "primary cache circuit is open and no secondary is registered".to_string(),
            }),
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.key_locks.lock();
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Read-through with **at-most-one concurrent compute per key**
    /// (spec §4.7, testable property 7).
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        backend: Option<&str>,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T, Error>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let name = self.resolve(backend)?;
        if let Some(bytes) = self.get_with_fallback(&name, key).await? {
            return serde_json::from_slice(&bytes).map_err(Error::from);
        }

        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;

        // Re-check: another waiter may have populated the entry while we
        // waited for the per-key lock.
        if let Some(bytes) = self.get_with_fallback(&name, key).await? {
            return serde_json::from_slice(&bytes).map_err(Error::from);
        }

        let value = producer().await?;
        let bytes = serde_json::to_vec(&value)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.set_with_fallback(&name, key, bytes, ttl).await?;
        Ok(value)
    }

    pub async fn invalidate(&self, backend: Option<&str>, pattern: &str) -> Result<u64, Error> {
        let name = self.resolve(backend)?;
        let (primary, secondary, _circuit) = self.active_backend(&name)?;
        let mut total = primary.delete_pattern(pattern).await.unwrap_or(0);
        if let Some(secondary) = secondary {
            total += secondary.delete_pattern(pattern).await.unwrap_or(0);
        }
        Ok(total)
    }

    /// Invalidates every query-cache entry namespaced to `model` across all
    /// registered backends (spec §4.2: writes emit `(model, *)` signals).
    pub async fn invalidate_model(&self, namespace: &str, model: &str) -> Result<u64, Error> {
        let pattern = format!("{namespace}:{model}:*");
        let names: Vec<String> = self.backends.lock().keys().cloned().collect();
        let mut total = 0u64;
        for name in names {
            total += self.invalidate(Some(&name), &pattern).await.unwrap_or(0);
        }
        Ok(total)
    }

    pub async fn stats(&self, backend: Option<&str>) -> Result<BackendStats, Error> {
        let name = self.resolve(backend)?;
        let (primary, _, _) = self.active_backend(&name)?;
        Ok(primary.stats().await)
    }
}

/// `<namespace>:<model>:<digest-of-query-payload>` key layout (spec §4.7).
pub fn query_cache_key(namespace: &str, model: &str, digest: &str) -> String {
    format!("{namespace}:{model}:{digest}")
}

/// `<namespace>:record:<model>:<id>:<projection-digest>` key layout.
pub fn record_cache_key(namespace: &str, model: &str, id: i64, projection_digest: &str) -> String {
    format!("{namespace}:record:{model}:{id}:{projection_digest}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryBackend;
    use crate::cache::EvictionStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn get_or_compute_runs_producer_once_under_concurrency() {
        let manager = Arc::new(CacheManager::new(Duration::from_secs(60)));
        manager.register(
            "mem",
            Arc::new(MemoryBackend::new(1000, EvictionStrategy::Lru)),
            None,
            5,
            Duration::from_secs(30),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let manager = manager.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .get_or_compute(None, "key", None, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, Error>(42i64)
                        }
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_model_clears_matching_keys_only() {
        let manager = CacheManager::new(Duration::from_secs(60));
        let backend = Arc::new(MemoryBackend::new(100, EvictionStrategy::Lru));
        manager.register("mem", backend.clone(), None, 5, Duration::from_secs(30));
        backend
            .set(&query_cache_key("odoo", "res.partner", "abc"), b"1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .set(&query_cache_key("odoo", "res.country", "def"), b"2".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        manager.invalidate_model("odoo", "res.partner").await.unwrap();
        assert!(backend.get(&query_cache_key("odoo", "res.partner", "abc")).await.unwrap().is_none());
        assert!(backend.get(&query_cache_key("odoo", "res.country", "def")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn falls_back_to_secondary_when_primary_circuit_opens() {
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl CacheBackend for AlwaysFails {
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, Error> {
                Err(Error::CacheConnectionError { message: "down".into() })
            }
            async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), Error> {
                Err(Error::CacheConnectionError { message: "down".into() })
            }
            async fn delete(&self, _key: &str) -> Result<(), Error> {
                Ok(())
            }
            async fn delete_pattern(&self, _pattern: &str) -> Result<u64, Error> {
                Ok(0)
            }
            async fn clear(&self) -> Result<(), Error> {
                Ok(())
            }
            async fn stats(&self) -> BackendStats {
                BackendStats::default()
            }
        }

        let manager = CacheManager::new(Duration::from_secs(60));
        let secondary = Arc::new(MemoryBackend::new(100, EvictionStrategy::Lru));
        manager.register("primary", Arc::new(AlwaysFails), Some(secondary.clone()), 1, Duration::from_secs(30));

        manager
            .get_or_compute(Some("primary"), "k", None, || async { Ok::<_, Error>(7i64) })
            .await
            .unwrap();
        assert!(secondary.get("k").await.unwrap().is_some());
    }
}
