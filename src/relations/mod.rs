//! Lazy relationship engine (spec §4.3, component G): resolution slots,
//! the grouped prefetch planner, and to-many mutation shortcuts.
pub mod descriptor;
pub mod prefetch;

pub use descriptor::{InverseCriteria, Many2OneSlot, RelationSlot, ToManySlot, TupleCommand};
pub use prefetch::{resolve_paths, MAX_DEPTH};

use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::Error;
use crate::model::ModelRegistry;
use crate::record::Record;
use crate::session::Session;

/// Resolves a single relation field on one record, fetching it from the
/// server if it is not already resolved (spec §4.3: on-demand resolution
/// outside of an explicit `.prefetch()`).
pub async fn resolve(session: &Arc<Session>, registry: &ModelRegistry, record: &mut Record, field: &str) -> Result<(), Error> {
    let model = record.model.clone();
    let already_resolved = matches!(
        record.relation(field),
        Some(RelationSlot::Many2One(Many2OneSlot::Resolved(_))) | Some(RelationSlot::ToMany(ToManySlot::Resolved(_)))
    );
    if already_resolved {
        return Ok(());
    }
    let mut singleton = [record.clone()];
    prefetch::resolve_paths(session, registry, &model, &mut singleton, std::slice::from_ref(&field.to_string())).await?;
    *record = singleton[0].clone();
    Ok(())
}

/// Applies a to-many mutation shortcut (`.add()/.remove()/.set()/.clear()`
/// in the spec's vocabulary) by writing the field's tuple-command list
/// directly (spec §4.3).
pub async fn mutate_to_many(
    session: &Arc<Session>,
    model: &str,
    id: i64,
    field: &str,
    commands: Vec<TupleCommand>,
) -> Result<(), Error> {
    let wire: Vec<Json> = commands.iter().map(TupleCommand::to_wire).collect();
    let mut values = serde_json::Map::new();
    values.insert(field.to_string(), Json::Array(wire));
    session
        .execute_kw(
            model,
            "write",
            Json::Array(vec![Json::Array(vec![Json::from(id)]), Json::Object(values)]),
            Json::Object(Default::default()),
        )
        .await?;
    Ok(())
}

pub async fn add(session: &Arc<Session>, model: &str, id: i64, field: &str, related_id: i64) -> Result<(), Error> {
    mutate_to_many(session, model, id, field, vec![TupleCommand::Link(related_id)]).await
}

pub async fn remove(session: &Arc<Session>, model: &str, id: i64, field: &str, related_id: i64) -> Result<(), Error> {
    mutate_to_many(session, model, id, field, vec![TupleCommand::Unlink(related_id)]).await
}

pub async fn set(session: &Arc<Session>, model: &str, id: i64, field: &str, related_ids: Vec<i64>) -> Result<(), Error> {
    mutate_to_many(session, model, id, field, vec![TupleCommand::Replace(related_ids)]).await
}

pub async fn clear(session: &Arc<Session>, model: &str, id: i64, field: &str) -> Result<(), Error> {
    mutate_to_many(session, model, id, field, vec![TupleCommand::Clear]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn add_writes_a_link_command() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"params": {"service": "common", "method": "authenticate"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": 1})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"params": {"service": "object", "method": "execute_kw"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": true})))
            .mount(&server)
            .await;
        let cfg = ClientConfig::new(server.uri());
        let session = Session::new(&cfg).unwrap();
        session.authenticate("admin", "admin").await.unwrap();
        let session = Arc::new(session);
        add(&session, "res.partner", 1, "child_ids", 5).await.unwrap();
    }
}
