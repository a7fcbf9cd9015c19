//! JSON-RPC framing over pooled HTTP connections (spec §4.1, component A).
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{DefaultErrorClassifier, Error, ErrorClassifier, ErrorContext};

#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Params<'a>,
}

#[derive(Serialize)]
struct Params<'a> {
    service: &'a str,
    method: &'a str,
    args: Value,
}

#[derive(Deserialize)]
struct Response {
    jsonrpc: Option<String>,
    id: Option<u64>,
    result: Option<Value>,
    error: Option<ResponseError>,
}

#[derive(Deserialize)]
struct ResponseError {
    #[allow(dead_code)]
    code: i64,
    message: String,
    data: Option<ResponseErrorData>,
}

#[derive(Deserialize)]
struct ResponseErrorData {
    name: Option<String>,
    debug: Option<String>,
    #[allow(dead_code)]
    arguments: Option<Value>,
}

/// Per-call overrides (spec §4.1): timeout, extra headers, alternate context.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
    pub context: Option<Value>,
}

/// Pooled JSON-RPC transport. Connection pooling and HTTP/2 multiplexing are
/// delegated to `reqwest::Client`'s own pool (mirrors the teacher's
/// `BigqueryClient`, which wraps one shared `reqwest::Client` per endpoint).
#[derive(Clone)]
pub struct Transport {
    http: Client,
    endpoint: String,
    next_id: Arc<AtomicU64>,
    default_timeout: Duration,
    classifier: Arc<dyn ErrorClassifier>,
}

impl Transport {
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(config.max_keepalive_connections)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls);
        // HTTP/2 is negotiated over TLS via ALPN automatically when available;
        // `http2_prior_knowledge` would instead assume a cleartext h2c
        // connection and break ordinary HTTPS endpoints, so the `http2` flag
        // only ever narrows to HTTP/1.1, never forces prior-knowledge h2.
        if !config.http2 {
            builder = builder.http1_only();
        }
        let http = builder
            .build()
            .map_err(|e| Error::ConnectionError {
                message: e.to_string(),
                context: ErrorContext::default(),
            })?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
            default_timeout: config.timeout,
            classifier: Arc::new(DefaultErrorClassifier),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// The primary RPC: `execute_kw(db, uid, password, model, method, args, kwargs)`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(model, method)))]
    pub async fn execute_kw(
        &self,
        db: &str,
        uid: i64,
        password: &str,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
        options: Option<CallOptions>,
    ) -> Result<Value, Error> {
        let positional = serde_json::json!([db, uid, password, model, method, args, kwargs]);
        self.call("object", "execute_kw", positional, model, method, options).await
    }

    /// `authenticate(db, login, credential, context)` — returns a uid or falsy.
    pub async fn authenticate(
        &self,
        db: &str,
        login: &str,
        credential: &str,
        context: Value,
    ) -> Result<Option<i64>, Error> {
        let args = serde_json::json!([db, login, credential, context]);
        let result = self.call("common", "authenticate", args, "common", "authenticate", None).await?;
        Ok(match result {
            Value::Number(n) if n.as_i64().map(|v| v != 0).unwrap_or(false) => n.as_i64(),
            _ => None,
        })
    }

    /// Server identity: never requires authentication.
    pub async fn healthcheck(&self) -> Result<Value, Error> {
        self.call("common", "version", serde_json::json!([]), "common", "version", None)
            .await
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, Error> {
        let v = self
            .call("db", "list", serde_json::json!([]), "db", "list", None)
            .await?;
        serde_json::from_value(v).map_err(Error::from)
    }

    async fn call(
        &self,
        service: &str,
        method: &'static str,
        args: Value,
        model_for_context: &str,
        method_for_context: &str,
        options: Option<CallOptions>,
    ) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            jsonrpc: "2.0",
            id,
            method: "call",
            params: Params { service, method, args },
        };

        let ctx = ErrorContext::new(model_for_context, method_for_context);
        let mut req = self.http.post(&self.endpoint).json(&envelope);
        let timeout = options.as_ref().and_then(|o| o.timeout).unwrap_or(self.default_timeout);
        req = req.timeout(timeout);
        if let Some(opts) = &options {
            for (k, v) in &opts.headers {
                req = req.header(k, v);
            }
        }

        let sent = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::TimeoutError {
                    message: e.to_string(),
                    context: ctx.clone(),
                }
            } else {
                Error::ConnectionError {
                    message: e.to_string(),
                    context: ctx.clone(),
                }
            }
        })?;

        let body: Response = sent.json().await.map_err(|e| Error::ProtocolError {
            message: format!("malformed envelope: {e}"),
        })?;

        if body.jsonrpc.as_deref() != Some("2.0") || body.id != Some(id) {
            return Err(Error::ProtocolError {
                message: "jsonrpc version or id mismatch".to_string(),
            });
        }

        if let Some(err) = body.error {
            let name = err.data.as_ref().and_then(|d| d.name.clone()).unwrap_or_default();
            let traceback = err.data.and_then(|d| d.debug);
            return Err(self.classifier.classify(&name, &err.message, traceback, ctx));
        }

        body.result.ok_or_else(|| Error::ProtocolError {
            message: "response carried neither result nor error".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn transport_against(server: &MockServer) -> Transport {
        let cfg = ClientConfig::new(server.uri());
        Transport::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn authenticate_returns_uid_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": 7
            })))
            .mount(&server)
            .await;
        let transport = transport_against(&server).await;
        let uid = transport
            .authenticate("db", "admin", "admin", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(uid, Some(7));
    }

    #[tokio::test]
    async fn authenticate_falsy_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": false
            })))
            .mount(&server)
            .await;
        let transport = transport_against(&server).await;
        let uid = transport
            .authenticate("db", "admin", "wrong", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(uid, None);
    }

    #[tokio::test]
    async fn server_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {
                    "code": 200,
                    "message": "Access denied",
                    "data": {"name": "odoo.exceptions.AccessError", "debug": "trace..."}
                }
            })))
            .mount(&server)
            .await;
        let transport = transport_against(&server).await;
        let err = transport
            .execute_kw(
                "db",
                7,
                "pw",
                "res.partner",
                "search_read",
                serde_json::json!([]),
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessError { .. }));
    }

    #[tokio::test]
    async fn id_mismatch_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 999, "result": {}
            })))
            .mount(&server)
            .await;
        let transport = transport_against(&server).await;
        let err = transport.healthcheck().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolError { .. }));
    }
}
