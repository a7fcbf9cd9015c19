//! Remote key-value backend (spec §4.7): a network cache with an expiry and
//! pattern-delete primitive, reachable over HTTP. Wraps its calls in its own
//! retry policy via `RetryManager`, independent of the manager-level
//! fallback chain in `cache::manager`.
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::cache::backend::{BackendStats, CacheBackend, Serializer};
use crate::error::Error;
use crate::retry::RetryManager;

#[derive(Clone)]
pub struct RemoteBackend {
    http: Client,
    endpoint: String,
    namespace: String,
    serializer: Serializer,
    retry: RetryManager,
}

#[derive(Serialize)]
struct SetRequest {
    value: String,
    ttl_secs: u64,
}

#[derive(Deserialize)]
struct GetResponse {
    value: Option<String>,
}

#[derive(Deserialize, Default)]
struct StatsResponse {
    hits: u64,
    misses: u64,
    size: u64,
    evictions: u64,
}

impl RemoteBackend {
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>, serializer: Serializer, max_connections: usize, retry: RetryManager) -> Result<Self, Error> {
        let http = Client::builder().pool_max_idle_per_host(max_connections).build().map_err(|e| Error::CacheConnectionError {
            message: e.to_string(),
        })?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            serializer,
            retry,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), self.namespace, key)
    }

    fn encode(&self, value: &[u8]) -> String {
        match self.serializer {
            Serializer::Json | Serializer::OpaqueBinary | Serializer::CompactBinary => {
                base64::engine::general_purpose::STANDARD.encode(value)
            }
        }
    }

    fn decode(&self, value: &str) -> Result<Vec<u8>, Error> {
        base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| Error::CacheError { message: e.to_string() })
    }
}

#[async_trait]
impl CacheBackend for RemoteBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let url = self.url(key);
        let http = self.http.clone();
        let resp: GetResponse = self
            .retry
            .invoke(&self.endpoint, "cache.get", || {
                let http = http.clone();
                let url = url.clone();
                async move {
                    let resp = http.get(&url).send().await.map_err(|e| Error::CacheConnectionError {
                        message: e.to_string(),
                    })?;
                    if resp.status() == reqwest::StatusCode::NOT_FOUND {
                        return Ok(GetResponse { value: None });
                    }
                    resp.json::<GetResponse>().await.map_err(|e| Error::CacheError { message: e.to_string() })
                }
            })
            .await?;
        match resp.value {
            Some(v) => Ok(Some(self.decode(&v)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let url = self.url(key);
        let body = SetRequest {
            value: self.encode(&value),
            ttl_secs: ttl.as_secs(),
        };
        let http = self.http.clone();
        self.retry
            .invoke(&self.endpoint, "cache.set", || {
                let http = http.clone();
                let url = url.clone();
                let body = serde_json::json!(&body);
                async move {
                    http.put(&url)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| Error::CacheConnectionError { message: e.to_string() })?;
                    Ok(())
                }
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let url = self.url(key);
        let http = self.http.clone();
        self.retry
            .invoke(&self.endpoint, "cache.delete", || {
                let http = http.clone();
                let url = url.clone();
                async move {
                    http.delete(&url)
                        .send()
                        .await
                        .map_err(|e| Error::CacheConnectionError { message: e.to_string() })?;
                    Ok(())
                }
            })
            .await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, Error> {
        let url = format!("{}/{}/_pattern", self.endpoint.trim_end_matches('/'), self.namespace);
        let pattern = pattern.to_string();
        let http = self.http.clone();
        self.retry
            .invoke(&self.endpoint, "cache.delete_pattern", || {
                let http = http.clone();
                let url = url.clone();
                let pattern = pattern.clone();
                async move {
                    let resp = http
                        .post(&url)
                        .json(&serde_json::json!({"pattern": pattern}))
                        .send()
                        .await
                        .map_err(|e| Error::CacheConnectionError { message: e.to_string() })?;
                    let deleted: u64 = resp.json().await.unwrap_or(0);
                    Ok(deleted)
                }
            })
            .await
    }

    async fn clear(&self) -> Result<(), Error> {
        self.delete_pattern("*").await.map(|_| ())
    }

    async fn stats(&self) -> BackendStats {
        let url = format!("{}/{}/_stats", self.endpoint.trim_end_matches('/'), self.namespace);
        let resp = self.http.get(&url).send().await.ok();
        let parsed: StatsResponse = match resp {
            Some(r) => r.json().await.unwrap_or_default(),
            None => StatsResponse::default(),
        };
        BackendStats {
            hits: parsed.hits,
            misses: parsed.misses,
            size: parsed.size,
            evictions: parsed.evictions,
        }
    }

    async fn ping(&self) -> Result<(), Error> {
        let url = format!("{}/{}/_ping", self.endpoint.trim_end_matches('/'), self.namespace);
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::CacheConnectionError { message: e.to_string() })?;
        Ok(())
    }
}
