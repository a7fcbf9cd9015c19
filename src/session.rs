//! Authentication lifecycle and request context (spec §4.1, component B).
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::transport::Transport;

#[derive(Clone, Debug, Default)]
struct AuthState {
    uid: Option<i64>,
    credential: Option<String>,
    default_context: Value,
}

/// `(server-endpoint, database, user-id, credential-token, default-context, pool)`
/// (spec §3). `uid` is `None` until `authenticate` succeeds.
#[derive(Clone)]
pub struct Session {
    pub(crate) transport: Transport,
    pub(crate) database: String,
    state: Arc<RwLock<AuthState>>,
}

impl Session {
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        let database = config.database.clone().unwrap_or_default();
        Ok(Self {
            transport: Transport::new(config)?,
            database,
            state: Arc::new(RwLock::new(AuthState::default())),
        })
    }

    /// Performs login; idempotent — re-authenticating updates the stored state.
    pub async fn authenticate(&self, login: &str, credential: &str) -> Result<i64, Error> {
        let uid = self
            .transport
            .authenticate(&self.database, login, credential, Value::Object(Default::default()))
            .await?
            .ok_or_else(|| Error::AuthenticationError {
                message: "server returned a falsy uid".to_string(),
            })?;
        let mut state = self.state.write();
        state.uid = Some(uid);
        state.credential = Some(credential.to_string());
        Ok(uid)
    }

    /// Clears auth state; outstanding calls using the old uid fail fast because
    /// `uid()`/`credential()` are read fresh on every call.
    pub fn logout(&self) {
        let mut state = self.state.write();
        *state = AuthState::default();
    }

    pub fn uid(&self) -> Result<i64, Error> {
        self.state.read().uid.ok_or_else(|| Error::AuthenticationError {
            message: "session is not authenticated".to_string(),
        })
    }

    pub fn credential(&self) -> Result<String, Error> {
        self.state
            .read()
            .credential
            .clone()
            .ok_or_else(|| Error::AuthenticationError {
                message: "session is not authenticated".to_string(),
            })
    }

    pub fn set_default_context(&self, context: Value) {
        self.state.write().default_context = context;
    }

    pub fn default_context(&self) -> Value {
        self.state.read().default_context.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().uid.is_some()
    }

    pub async fn healthcheck(&self) -> Result<Value, Error> {
        self.transport.healthcheck().await
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, Error> {
        self.transport.list_databases().await
    }

    pub(crate) async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<Value, Error> {
        let uid = self.uid()?;
        let credential = self.credential()?;
        self.transport
            .execute_kw(&self.database, uid, &credential, model, method, args, kwargs, None)
            .await
    }
}
