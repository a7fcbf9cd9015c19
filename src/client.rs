//! Top-level client (spec §3): wires the session, model registry, retry
//! manager, and cache manager together into the public entry point (mirrors
//! the teacher's `BigqueryClient`, which assembles a `Client` from a
//! `ClientConfig` the same way).
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;

use crate::batch::{self, BatchMode, BatchOutcome, ProgressSink};
use crate::cache::{CacheBackendKind, CacheManager, MemoryBackend, RemoteBackend};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::model::{ModelDescriptor, ModelRegistry};
use crate::query::QuerySet;
use crate::record::Record;
use crate::relations;
use crate::retry::RetryManager;
use crate::session::Session;
use crate::transaction::{DeadlockRetryPolicy, TransactionScope};

/// The library's entry point. One `Client` per server endpoint; cheap to
/// clone (every field is reference-counted).
#[derive(Clone)]
pub struct Client {
    session: Arc<Session>,
    registry: ModelRegistry,
    retry: Arc<RetryManager>,
    cache: Option<Arc<CacheManager>>,
    cache_namespace: String,
    batch_config: crate::config::BatchConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let retry = Arc::new(RetryManager::new(config.retry.clone()));
        let session = Arc::new(Session::new(&config)?);
        let cache = build_cache_manager(&config)?;
        Ok(Self {
            session,
            registry: ModelRegistry::new(),
            retry,
            cache,
            cache_namespace: config.cache.namespace.clone(),
            batch_config: config.batch.clone(),
        })
    }

    pub fn from_env() -> Result<Self, Error> {
        Self::new(ClientConfig::from_env()?)
    }

    pub async fn authenticate(&self, login: &str, credential: &str) -> Result<i64, Error> {
        self.session.authenticate(login, credential).await
    }

    pub fn logout(&self) {
        self.session.logout()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub async fn healthcheck(&self) -> Result<Json, Error> {
        self.session.healthcheck().await
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, Error> {
        self.session.list_databases().await
    }

    pub fn set_default_context(&self, context: Json) {
        self.session.set_default_context(context)
    }

    /// Registers a model's immutable field descriptor, required before
    /// `.model()` can build queries against it (spec §3).
    pub fn register_model(&self, descriptor: ModelDescriptor) {
        self.registry.register(descriptor)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn retry_manager(&self) -> Arc<RetryManager> {
        self.retry.clone()
    }

    pub fn cache_manager(&self) -> Option<Arc<CacheManager>> {
        self.cache.clone()
    }

    /// Opens a chainable query over a registered model (spec §4.2).
    pub fn model(&self, name: &str) -> Result<QuerySet, Error> {
        let descriptor = self.registry.get(name).ok_or_else(|| Error::ProtocolError {
            message: format!("model '{name}' is not registered"),
        })?;
        let mut qs = QuerySet::new(self.session.clone(), descriptor).with_retry(self.retry.clone());
        if let Some(cache) = &self.cache {
            qs = qs.with_cache(cache.clone(), self.cache_namespace.clone());
        }
        Ok(qs)
    }

    /// Same as [`Self::model`], but binds the query set to `scope` so
    /// `delete`/`update`/`get_or_create` journal their writes into it
    /// instead of bypassing compensation (spec §4.2).
    pub fn model_in_scope(&self, name: &str, scope: &TransactionScope) -> Result<QuerySet, Error> {
        Ok(self.model(name)?.with_scope(scope.clone()))
    }

    /// Enters a top-level transaction scope bound to the calling task
    /// (spec §4.5). The scope is wired with this client's model registry so
    /// a `delete` whose record populates a cascading relation field is
    /// journaled as irreversible instead of reversible (SPEC_FULL.md §11).
    pub fn transaction(&self) -> Result<TransactionScope, Error> {
        TransactionScope::enter_with_registry(self.session.clone(), Some(self.retry.clone()), Some(self.registry.clone()))
    }

    /// Runs `body` under a scope, retrying the whole scope on a deadlock
    /// classified error (spec §4.5).
    pub async fn transaction_with_deadlock_retry<T, F, Fut>(&self, policy: &DeadlockRetryPolicy, body: F) -> Result<T, Error>
    where
        F: FnMut(TransactionScope) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        TransactionScope::run_with_deadlock_retry_and_registry(self.session.clone(), Some(self.retry.clone()), Some(self.registry.clone()), policy, body).await
    }

    /// Runs under `scope` if given, so each chunk's writes journal as one
    /// grouped entry the scope can roll back (spec §4.4/§4.5).
    pub async fn bulk_create(
        &self,
        model: &str,
        records: Vec<Json>,
        mode: BatchMode,
        scope: Option<&TransactionScope>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> BatchOutcome<i64> {
        batch::bulk_create(self.session.clone(), Some(self.retry.clone()), model, records, &self.batch_config, mode, scope.cloned(), progress).await
    }

    pub async fn bulk_update(
        &self,
        model: &str,
        ids: Vec<i64>,
        changes: Json,
        mode: BatchMode,
        scope: Option<&TransactionScope>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> BatchOutcome<i64> {
        batch::bulk_update(self.session.clone(), Some(self.retry.clone()), model, ids, changes, &self.batch_config, mode, scope.cloned(), progress).await
    }

    pub async fn bulk_delete(
        &self,
        model: &str,
        ids: Vec<i64>,
        mode: BatchMode,
        scope: Option<&TransactionScope>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> BatchOutcome<i64> {
        batch::bulk_delete(self.session.clone(), Some(self.retry.clone()), model, ids, &self.batch_config, mode, scope.cloned(), progress).await
    }

    /// Resolves one relation field on `record`, issuing a server read only
    /// if it is not already resolved (spec §4.3).
    pub async fn resolve(&self, record: &mut Record, field: &str) -> Result<(), Error> {
        relations::resolve(&self.session, &self.registry, record, field).await
    }

    /// Eagerly resolves every path in `paths` across `records` with the
    /// grouped prefetch planner (spec §4.3).
    pub async fn prefetch(&self, model: &str, records: &mut [Record], paths: &[String]) -> Result<(), Error> {
        relations::resolve_paths(&self.session, &self.registry, model, records, paths).await
    }

    pub async fn relation_add(&self, model: &str, id: i64, field: &str, related_id: i64) -> Result<(), Error> {
        relations::add(&self.session, model, id, field, related_id).await
    }

    pub async fn relation_remove(&self, model: &str, id: i64, field: &str, related_id: i64) -> Result<(), Error> {
        relations::remove(&self.session, model, id, field, related_id).await
    }

    pub async fn relation_set(&self, model: &str, id: i64, field: &str, related_ids: Vec<i64>) -> Result<(), Error> {
        relations::set(&self.session, model, id, field, related_ids).await
    }

    pub async fn relation_clear(&self, model: &str, id: i64, field: &str) -> Result<(), Error> {
        relations::clear(&self.session, model, id, field).await
    }
}

fn build_cache_manager(config: &ClientConfig) -> Result<Option<Arc<CacheManager>>, Error> {
    let manager = CacheManager::new(config.cache.default_ttl);
    match config.cache.backend {
        CacheBackendKind::Memory => {
            let backend = Arc::new(MemoryBackend::new(config.cache.max_size, config.cache.strategy));
            manager.register(
                "default",
                backend,
                None,
                config.retry.circuit.failure_threshold,
                config.retry.circuit.recovery_timeout,
            );
        }
        CacheBackendKind::Remote => {
            let url = config.cache.url.clone().ok_or_else(|| Error::CacheError {
                message: "ODOO_CACHE_URL is required when the remote cache backend is selected".to_string(),
            })?;
            let remote_retry = RetryManager::new(config.retry.clone());
            let backend = Arc::new(RemoteBackend::new(
                url,
                config.cache.namespace.clone(),
                config.cache.serializer,
                config.cache.max_connections,
                remote_retry,
            )?);
            let secondary: Arc<dyn crate::cache::CacheBackend> = Arc::new(MemoryBackend::new(config.cache.max_size, config.cache.strategy));
            manager.register(
                "default",
                backend,
                Some(secondary),
                config.retry.circuit.failure_threshold,
                config.retry.circuit.recovery_timeout,
            );
        }
    }
    Ok(Some(Arc::new(manager)))
}

#[allow(dead_code)]
fn default_batch_timeout() -> Duration {
    Duration::from_secs(120)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDescriptor, FieldType};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn model_requires_registration() {
        let server = MockServer::start().await;
        let client = Client::new(ClientConfig::new(server.uri())).unwrap();
        let err = client.model("res.partner").unwrap_err();
        assert!(matches!(err, Error::ProtocolError { .. }));
    }

    #[tokio::test]
    async fn registered_model_round_trips_through_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"params": {"service": "common", "method": "authenticate"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": 1})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"params": {"service": "object"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": [{"id": 1, "name": "Acme"}]
            })))
            .mount(&server)
            .await;
        let client = Client::new(ClientConfig::new(server.uri())).unwrap();
        client.authenticate("admin", "admin").await.unwrap();
        client.register_model(ModelDescriptor::new(
            "res.partner",
            vec![
                FieldDescriptor::new("id", FieldType::Integer, false),
                FieldDescriptor::new("name", FieldType::Text, false),
            ],
        ));
        let records = client.model("res.partner").unwrap().all().await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
