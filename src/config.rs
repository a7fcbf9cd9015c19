//! Environment-driven configuration (spec §6) with the teacher's `with_*`
//! builder convention (see `bigquery::client::ClientConfig`).
use std::env;
use std::time::Duration;

use crate::cache::CacheBackendKind;
use crate::retry::{RetryStrategyKind, RetrySettings};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) endpoint: String,
    pub(crate) database: Option<String>,
    pub(crate) credential: Option<String>,
    pub(crate) verify_tls: bool,
    pub(crate) timeout: Duration,
    pub(crate) max_connections: usize,
    pub(crate) max_keepalive_connections: usize,
    pub(crate) http2: bool,
    pub(crate) retry: RetrySettings,
    pub(crate) cache: CacheConfig,
    pub(crate) batch: BatchConfig,
    pub(crate) debug: bool,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub max_size: usize,
    pub default_ttl: Duration,
    pub strategy: crate::cache::EvictionStrategy,
    pub url: Option<String>,
    pub namespace: String,
    pub serializer: crate::cache::Serializer,
    pub max_connections: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            max_size: 10_000,
            default_ttl: Duration::from_secs(300),
            strategy: crate::cache::EvictionStrategy::Lru,
            url: None,
            namespace: "odoo".to_string(),
            serializer: crate::cache::Serializer::Json,
            max_connections: 20,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub max_chunk_size: usize,
    pub max_concurrency: usize,
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 100,
            max_concurrency: 4,
            timeout: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            database: None,
            credential: None,
            verify_tls: true,
            timeout: Duration::from_secs(30),
            max_connections: 100,
            max_keepalive_connections: 20,
            http2: true,
            retry: RetrySettings::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            debug: false,
        }
    }

    pub fn with_database(mut self, value: impl Into<String>) -> Self {
        self.database = Some(value.into());
        self
    }

    pub fn with_credential(mut self, value: impl Into<String>) -> Self {
        self.credential = Some(value.into());
        self
    }

    pub fn with_verify_tls(mut self, value: bool) -> Self {
        self.verify_tls = value;
        self
    }

    pub fn with_timeout(mut self, value: Duration) -> Self {
        self.timeout = value;
        self
    }

    pub fn with_max_connections(mut self, value: usize) -> Self {
        self.max_connections = value;
        self
    }

    pub fn with_max_keepalive_connections(mut self, value: usize) -> Self {
        self.max_keepalive_connections = value;
        self
    }

    pub fn with_http2(mut self, value: bool) -> Self {
        self.http2 = value;
        self
    }

    pub fn with_retry(mut self, value: RetrySettings) -> Self {
        self.retry = value;
        self
    }

    pub fn with_cache(mut self, value: CacheConfig) -> Self {
        self.cache = value;
        self
    }

    pub fn with_batch(mut self, value: BatchConfig) -> Self {
        self.batch = value;
        self
    }

    pub fn with_debug(mut self, value: bool) -> Self {
        self.debug = value;
        self
    }

    /// Builds a config from the environment-driven table of spec §6.
    /// `ODOO_ENDPOINT` is mandatory; every other key falls back to its
    /// documented default.
    pub fn from_env() -> Result<Self, crate::error::Error> {
        let endpoint = env::var("ODOO_ENDPOINT").map_err(|_| crate::error::Error::ProtocolError {
            message: "ODOO_ENDPOINT is not set".to_string(),
        })?;
        let mut cfg = Self::new(endpoint);

        if let Ok(v) = env::var("ODOO_DATABASE") {
            cfg.database = Some(v);
        }
        if let Ok(v) = env::var("ODOO_CREDENTIAL") {
            cfg.credential = Some(v);
        }
        if let Ok(v) = env_bool("ODOO_VERIFY_TLS") {
            cfg.verify_tls = v;
        }
        if let Ok(v) = env_secs("ODOO_TIMEOUT") {
            cfg.timeout = v;
        }
        if let Ok(v) = env_usize("ODOO_MAX_CONNECTIONS") {
            cfg.max_connections = v;
        }
        if let Ok(v) = env_usize("ODOO_MAX_KEEPALIVE_CONNECTIONS") {
            cfg.max_keepalive_connections = v;
        }
        if let Ok(v) = env_bool("ODOO_HTTP2") {
            cfg.http2 = v;
        }

        if let Ok(v) = env::var("ODOO_RETRY_STRATEGY") {
            cfg.retry.strategy = match v.as_str() {
                "linear" => RetryStrategyKind::Linear,
                "fixed" => RetryStrategyKind::Fixed,
                _ => RetryStrategyKind::Exponential,
            };
        }
        if let Ok(v) = env_u32("ODOO_RETRY_MAX_ATTEMPTS") {
            cfg.retry.max_attempts = v;
        }
        if let Ok(v) = env_secs("ODOO_RETRY_BASE_DELAY") {
            cfg.retry.base_delay = v;
        }
        if let Ok(v) = env_secs("ODOO_RETRY_MAX_DELAY") {
            cfg.retry.max_delay = v;
        }
        if let Ok(v) = env::var("ODOO_RETRY_JITTER").and_then(|s| s.parse::<f64>().map_err(|_| env::VarError::NotPresent)) {
            cfg.retry.jitter = v;
        }
        if let Ok(v) = env_u32("ODOO_RETRY_CIRCUIT_FAILURE_THRESHOLD") {
            cfg.retry.circuit.failure_threshold = v;
        }
        if let Ok(v) = env_secs("ODOO_RETRY_CIRCUIT_RECOVERY_TIMEOUT") {
            cfg.retry.circuit.recovery_timeout = v;
        }
        if let Ok(v) = env_u32("ODOO_RETRY_CIRCUIT_SUCCESS_THRESHOLD") {
            cfg.retry.circuit.success_threshold = v;
        }
        if let Ok(v) = env_u32("ODOO_RETRY_CIRCUIT_HALF_OPEN_BUDGET") {
            cfg.retry.circuit.half_open_permit_budget = v;
        }

        if let Ok(v) = env::var("ODOO_CACHE_BACKEND") {
            cfg.cache.backend = match v.as_str() {
                "remote" => CacheBackendKind::Remote,
                _ => CacheBackendKind::Memory,
            };
        }
        if let Ok(v) = env_usize("ODOO_CACHE_MAX_SIZE") {
            cfg.cache.max_size = v;
        }
        if let Ok(v) = env_secs("ODOO_CACHE_DEFAULT_TTL") {
            cfg.cache.default_ttl = v;
        }
        if let Ok(v) = env::var("ODOO_CACHE_STRATEGY") {
            cfg.cache.strategy = match v.as_str() {
                "lfu" => crate::cache::EvictionStrategy::Lfu,
                "ttl" => crate::cache::EvictionStrategy::Ttl,
                _ => crate::cache::EvictionStrategy::Lru,
            };
        }
        if let Ok(v) = env::var("ODOO_CACHE_URL") {
            cfg.cache.url = Some(v);
        }
        if let Ok(v) = env::var("ODOO_CACHE_NAMESPACE") {
            cfg.cache.namespace = v;
        }
        if let Ok(v) = env::var("ODOO_CACHE_SERIALIZER") {
            cfg.cache.serializer = match v.as_str() {
                "opaque-binary" => crate::cache::Serializer::OpaqueBinary,
                "compact-binary" => crate::cache::Serializer::CompactBinary,
                _ => crate::cache::Serializer::Json,
            };
        }
        if let Ok(v) = env_usize("ODOO_CACHE_MAX_CONNECTIONS") {
            cfg.cache.max_connections = v;
        }

        if let Ok(v) = env_usize("ODOO_BATCH_MAX_CHUNK_SIZE") {
            cfg.batch.max_chunk_size = v;
        }
        if let Ok(v) = env_usize("ODOO_BATCH_MAX_CONCURRENCY") {
            cfg.batch.max_concurrency = v;
        }
        if let Ok(v) = env_secs("ODOO_BATCH_TIMEOUT") {
            cfg.batch.timeout = v;
        }

        Ok(cfg)
    }
}

fn env_bool(key: &str) -> Result<bool, env::VarError> {
    env::var(key).map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
}

fn env_usize(key: &str) -> Result<usize, env::VarError> {
    env::var(key).and_then(|v| v.parse().map_err(|_| env::VarError::NotPresent))
}

fn env_u32(key: &str) -> Result<u32, env::VarError> {
    env::var(key).and_then(|v| v.parse().map_err(|_| env::VarError::NotPresent))
}

fn env_secs(key: &str) -> Result<Duration, env::VarError> {
    env::var(key)
        .and_then(|v| v.parse::<u64>().map_err(|_| env::VarError::NotPresent))
        .map(Duration::from_secs)
}
