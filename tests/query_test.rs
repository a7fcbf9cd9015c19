//! End-to-end coverage of the chainable query builder against a mocked
//! JSON-RPC endpoint (spec §4.2).
mod common;

use odoo_client::model::{FieldDescriptor, FieldType, ModelDescriptor};
use odoo_client::query::{Expr, Leaf, Lookup};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn register_partner(client: &odoo_client::Client) {
    client.register_model(ModelDescriptor::new(
        "res.partner",
        vec![
            FieldDescriptor::new("id", FieldType::Integer, false),
            FieldDescriptor::new("name", FieldType::Text, false),
            FieldDescriptor::new("is_company", FieldType::Boolean, false),
        ],
    ));
}

#[tokio::test]
async fn filter_order_and_limit_round_trip_through_search_read() {
    let server = MockServer::start().await;
    let client = common::authed_client(&server).await;
    register_partner(&client);

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({
            "params": {"service": "object", "method": "execute_kw"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "result": [{"id": 1, "name": "Acme", "is_company": true}]
        })))
        .mount(&server)
        .await;

    let records = client
        .model("res.partner")
        .unwrap()
        .filter(Expr::Leaf(Leaf::new("is_company", Lookup::Exact, true.into())))
        .order_by(["name"])
        .limit(10)
        .all()
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, Some(1));
}

#[tokio::test]
async fn limit_zero_never_touches_the_mock_server() {
    let server = MockServer::start().await;
    let client = common::authed_client(&server).await;
    register_partner(&client);
    // Deliberately no `search_read` mock: a real request would make wiremock
    // panic with "no matching request found".
    let records = client.model("res.partner").unwrap().limit(0).all().await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn get_on_missing_id_surfaces_not_found() {
    let server = MockServer::start().await;
    let client = common::authed_client(&server).await;
    register_partner(&client);
    common::mount_object_result(&server, serde_json::json!([])).await;

    let err = client.model("res.partner").unwrap().get(999).await.unwrap_err();
    assert!(matches!(err, odoo_client::Error::NotFoundError { .. }));
}

#[tokio::test]
async fn get_or_create_returns_the_existing_record_without_creating() {
    let server = MockServer::start().await;
    let client = common::authed_client(&server).await;
    register_partner(&client);
    common::mount_object_result(&server, serde_json::json!([{"id": 7, "name": "Acme", "is_company": true}])).await;

    let (record, created) = client
        .model("res.partner")
        .unwrap()
        .filter_lookup("name__exact", serde_json::json!("Acme"))
        .get_or_create(serde_json::Map::new())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(record.id, Some(7));
}
