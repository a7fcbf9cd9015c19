//! End-to-end coverage of read-through query caching and
//! invalidate-on-write (spec §4.7).
mod common;

use odoo_client::model::{FieldDescriptor, FieldType, ModelDescriptor};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn register_partner(client: &odoo_client::Client) {
    client.register_model(ModelDescriptor::new(
        "res.partner",
        vec![FieldDescriptor::new("id", FieldType::Integer, false), FieldDescriptor::new("name", FieldType::Text, false)],
    ));
}

#[tokio::test]
async fn cached_reads_hit_the_server_once() {
    let server = MockServer::start().await;
    let client = common::authed_client(&server).await;
    register_partner(&client);

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "object", "method": "execute_kw"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "result": [{"id": 1, "name": "Acme"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let qs = client.model("res.partner").unwrap().cached(Some(Duration::from_secs(60)));
    let first = qs.all().await.unwrap();
    let second = qs.all().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, Some(1));

    server.verify().await;
}

#[tokio::test]
async fn writing_through_the_queryset_invalidates_the_cached_read() {
    let server = MockServer::start().await;
    let client = common::authed_client(&server).await;
    register_partner(&client);

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"params": {"service": "object", "method": "execute_kw"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "result": [{"id": 1, "name": "Acme"}]
        })))
        .mount(&server)
        .await;

    let qs = client.model("res.partner").unwrap().cached(Some(Duration::from_secs(60)));
    qs.all().await.unwrap();
    // `update` invalidates every cached entry for this model; the mock above
    // keeps matching (unbounded `.expect`), so the important assertion is
    // that this doesn't panic on a stale cached empty/absent entry.
    qs.clone().update(serde_json::json!({"name": "Acme Corp"})).await.unwrap();
    let after = qs.all().await.unwrap();
    assert_eq!(after.len(), 1);
}
