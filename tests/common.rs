//! Shared wiremock scaffolding for the integration suite: every test stands
//! up its own `MockServer` in place of a live Odoo instance, mirroring the
//! unit tests' use of `wiremock` throughout `src/`.
use odoo_client::client::Client;
use odoo_client::config::ClientConfig;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Mounts the `authenticate` RPC and returns a `Client` already logged in.
pub async fn authed_client(server: &MockServer) -> Client {
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "common", "method": "authenticate"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": 1})))
        .mount(server)
        .await;
    let client = Client::new(ClientConfig::new(server.uri())).expect("client config is valid");
    client.authenticate("admin", "admin").await.expect("mocked authenticate succeeds");
    client
}

/// Mounts a catch-all `execute_kw` response, used by tests that only care
/// about one object-service round trip.
pub async fn mount_object_result(server: &MockServer, result: serde_json::Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "object"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": result})))
        .mount(server)
        .await;
}
