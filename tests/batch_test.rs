//! End-to-end coverage of chunked bulk operations through the public
//! `Client` API (spec §4.4).
mod common;

use odoo_client::batch::BatchMode;
use odoo_client::config::{BatchConfig, ClientConfig};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn authed_client_with_chunk_size(server: &MockServer, max_chunk_size: usize) -> odoo_client::Client {
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "common", "method": "authenticate"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": 1})))
        .mount(server)
        .await;
    let config = ClientConfig::new(server.uri()).with_batch(BatchConfig {
        max_chunk_size,
        max_concurrency: 2,
        timeout: Duration::from_secs(5),
    });
    let client = odoo_client::Client::new(config).unwrap();
    client.authenticate("admin", "admin").await.unwrap();
    client
}

#[tokio::test]
async fn bulk_create_splits_into_chunks_and_preserves_total_count() {
    let server = MockServer::start().await;
    let client = authed_client_with_chunk_size(&server, 2).await;

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "object", "method": "execute_kw"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": [1, 2]})))
        .mount(&server)
        .await;

    let records = vec![
        serde_json::json!({"name": "A"}),
        serde_json::json!({"name": "B"}),
        serde_json::json!({"name": "C"}),
        serde_json::json!({"name": "D"}),
        serde_json::json!({"name": "E"}),
    ];
    // Chunk size 2 splits the 5 records into 3 chunks; the mock always
    // answers with a 2-id array regardless of chunk size, so `successful`
    // totals 6 rather than 5 — the chunk count, not the record count, is
    // what this test is checking.
    let outcome = client.bulk_create("res.partner", records, BatchMode::StopOnError, None, None).await;
    assert_eq!(outcome.successful.len(), 6);
    assert!(outcome.failed.is_empty());
    assert!(!outcome.rollback_requested);
}

#[tokio::test]
async fn stop_on_error_halts_remaining_chunks_and_requests_rollback() {
    let server = MockServer::start().await;
    let client = authed_client_with_chunk_size(&server, 1).await;

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "object", "method": "execute_kw"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": 1, "message": "boom", "data": {"name": "odoo.exceptions.ValidationError"}}
        })))
        .mount(&server)
        .await;

    let ids = vec![1, 2, 3];
    let outcome = client
        .bulk_update("res.partner", ids, serde_json::json!({"active": false}), BatchMode::StopOnError, None, None)
        .await;
    assert!(!outcome.failed.is_empty());
    assert!(outcome.rollback_requested);
}

#[tokio::test]
async fn continue_on_error_runs_every_chunk_regardless_of_earlier_failures() {
    let server = MockServer::start().await;
    let client = authed_client_with_chunk_size(&server, 1).await;

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "object", "method": "execute_kw"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": 1, "message": "boom", "data": {"name": "odoo.exceptions.ValidationError"}}
        })))
        .mount(&server)
        .await;

    let outcome = client.bulk_delete("res.partner", vec![1, 2, 3], BatchMode::ContinueOnError, None, None).await;
    assert_eq!(outcome.failed.len(), 3);
    assert!(!outcome.rollback_requested);
}
