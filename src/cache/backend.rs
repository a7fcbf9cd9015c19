//! Abstract cache backend contract (spec §4.7), identical for every concrete
//! backend.
use async_trait::async_trait;
use std::time::Duration;

use crate::error::Error;

#[derive(Clone, Copy, Debug, Default)]
pub struct BackendStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub evictions: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionStrategy {
    Ttl,
    Lru,
    Lfu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Serializer {
    Json,
    OpaqueBinary,
    CompactBinary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    Remote,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;
    /// Deletes all keys matching a glob-style pattern, e.g. `"odoo:res.partner:*"`.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, Error>;
    async fn clear(&self) -> Result<(), Error>;
    async fn stats(&self) -> BackendStats;
    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Matches the subset of glob syntax the cache manager needs: a single
/// trailing `*` wildcard, as used by `(model, *)` invalidation keys.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_prefix_wildcard_matches() {
        assert!(glob_match("odoo:res.partner:*", "odoo:res.partner:abcd"));
        assert!(!glob_match("odoo:res.partner:*", "odoo:res.country:abcd"));
        assert!(glob_match("odoo:res.partner:exact", "odoo:res.partner:exact"));
        assert!(!glob_match("odoo:res.partner:exact", "odoo:res.partner:other"));
    }
}
