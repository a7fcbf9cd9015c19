//! Grouped follow-up read planner (spec §4.3): resolves every declared
//! relation path across a batch of parent records in a bounded number of
//! server round trips — `1 + R` where `R` is the number of distinct relation
//! paths, regardless of the cardinality of the parent set.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::Error;
use crate::model::{FieldType, ModelRegistry};
use crate::query::{Expr, Leaf, Lookup, QuerySet};
use crate::record::Record;
use crate::relations::descriptor::{InverseCriteria, Many2OneSlot, RelationSlot, ToManySlot};
use crate::session::Session;

/// Prefetch paths nest at most this deep (spec §4.3 invariant).
pub const MAX_DEPTH: usize = 4;

/// Resolves `paths` (dotted relation paths, e.g. `"country_id.state_id"`)
/// across every record in `records`, mutating their relation slots in place.
/// A `(model, id, path)` triple is only ever read once, even if several
/// parent records share the same related id (cycle guard).
pub async fn resolve_paths(
    session: &Arc<Session>,
    registry: &ModelRegistry,
    model: &str,
    records: &mut [Record],
    paths: &[String],
) -> Result<(), Error> {
    let mut seen: HashSet<(String, i64, String)> = HashSet::new();
    for path in paths {
        resolve_one_path(session, registry, model, records, path, 1, &mut seen).await?;
    }
    Ok(())
}

fn split_first_segment(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((first, rest)) => (first, Some(rest)),
        None => (path, None),
    }
}

/// Recurses one relation-path segment at a time; boxed by hand since an
/// `async fn` cannot call itself without indirection.
fn resolve_one_path<'a>(
    session: &'a Arc<Session>,
    registry: &'a ModelRegistry,
    model: &'a str,
    records: &'a mut [Record],
    path: &'a str,
    depth: usize,
    seen: &'a mut HashSet<(String, i64, String)>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(resolve_one_path_inner(session, registry, model, records, path, depth, seen))
}

async fn resolve_one_path_inner(
    session: &Arc<Session>,
    registry: &ModelRegistry,
    model: &str,
    records: &mut [Record],
    path: &str,
    depth: usize,
    seen: &mut HashSet<(String, i64, String)>,
) -> Result<(), Error> {
    if depth > MAX_DEPTH {
        return Err(Error::ProtocolError {
            message: format!("prefetch path '{path}' exceeds the maximum depth of {MAX_DEPTH}"),
        });
    }
    let (field, rest) = split_first_segment(path);
    let descriptor = registry.get(model).ok_or_else(|| Error::ProtocolError {
        message: format!("unknown model '{model}' in prefetch path"),
    })?;
    let field_descriptor = descriptor.field(field).ok_or_else(|| Error::ProtocolError {
        message: format!("unknown field '{field}' on '{model}' in prefetch path"),
    })?;
    let target = field_descriptor.field_type.target_model().ok_or_else(|| Error::ProtocolError {
        message: format!("field '{field}' on '{model}' is not relational"),
    })?;

    let fresh_ids = dedupe_unresolved_ids(records, field, model, seen);
    let target_descriptor = registry.get(target).ok_or_else(|| Error::ProtocolError {
        message: format!("unknown target model '{target}' in prefetch path"),
    })?;

    let mut by_id: HashMap<i64, Record> = HashMap::new();
    if !fresh_ids.is_empty() {
        let qs = QuerySet::new(session.clone(), target_descriptor.clone())
            .filter(Expr::Leaf(Leaf::new("id", Lookup::In, serde_json::to_value(&fresh_ids).unwrap())));
        for record in qs.all().await? {
            if let Some(id) = record.id {
                by_id.insert(id, record);
            }
        }
    }

    // to-many relations resolved by inverse key group in one read per unique
    // inverse field, rather than one read per parent.
    let inverse_groups = collect_inverse_groups(records, field, model, seen);
    let mut by_inverse: HashMap<i64, Vec<Record>> = HashMap::new();
    if !inverse_groups.is_empty() {
        if let FieldType::One2Many { inverse, .. } = &field_descriptor.field_type {
            let parent_ids: Vec<i64> = inverse_groups.iter().map(|c| c.parent_id).collect();
            let qs = QuerySet::new(session.clone(), target_descriptor.clone())
                .filter(Expr::Leaf(Leaf::new(inverse.clone(), Lookup::In, serde_json::to_value(&parent_ids).unwrap())));
            for record in qs.all().await? {
                if let Some(RelationSlot::Many2One(slot)) = record.relation(inverse) {
                    if let Some(parent_id) = slot.unresolved_id() {
                        by_inverse.entry(parent_id).or_default().push(record.clone());
                    }
                }
            }
        }
    }

    for record in records.iter_mut() {
        apply_resolution(record, field, &by_id, &by_inverse);
    }

    if let Some(rest) = rest {
        let mut nested: Vec<Record> = by_id.into_values().collect();
        resolve_one_path(session, registry, target, &mut nested, rest, depth + 1, seen).await?;
        let nested_by_id: HashMap<i64, Record> = nested.into_iter().filter_map(|r| r.id.map(|id| (id, r))).collect();
        for record in records.iter_mut() {
            reapply_nested(record, field, &nested_by_id);
        }
    }

    Ok(())
}

fn dedupe_unresolved_ids(records: &[Record], field: &str, model: &str, seen: &mut HashSet<(String, i64, String)>) -> Vec<i64> {
    let mut ids = vec![];
    for record in records {
        if let Some(RelationSlot::Many2One(slot)) = record.relation(field) {
            if let Some(id) = slot.unresolved_id() {
                if seen.insert((model.to_string(), id, field.to_string())) {
                    ids.push(id);
                }
            }
        }
        if let Some(RelationSlot::ToMany(ToManySlot::UnresolvedIds(ids_list))) = record.relation(field) {
            for id in ids_list {
                if seen.insert((model.to_string(), *id, field.to_string())) {
                    ids.push(*id);
                }
            }
        }
    }
    ids
}

fn collect_inverse_groups(records: &[Record], field: &str, model: &str, seen: &mut HashSet<(String, i64, String)>) -> Vec<InverseCriteria> {
    let mut groups = vec![];
    for record in records {
        if let Some(RelationSlot::ToMany(ToManySlot::UnresolvedCriteria(criteria))) = record.relation(field) {
            if let Some(parent_id) = record.id {
                if seen.insert((model.to_string(), parent_id, field.to_string())) {
                    groups.push(InverseCriteria {
                        inverse_field: criteria.inverse_field.clone(),
                        parent_id,
                    });
                }
            }
        }
    }
    groups
}

fn apply_resolution(record: &mut Record, field: &str, by_id: &HashMap<i64, Record>, by_inverse: &HashMap<i64, Vec<Record>>) {
    let parent_id = record.id;
    if let Some(slot) = record.relation_mut(field) {
        match slot {
            RelationSlot::Many2One(m) => {
                if let Some(id) = m.unresolved_id() {
                    *m = Many2OneSlot::Resolved(by_id.get(&id).cloned().map(Box::new));
                } else if m.is_null() {
                    *m = Many2OneSlot::Resolved(None);
                }
            }
            RelationSlot::ToMany(t) => match t {
                ToManySlot::UnresolvedIds(ids) => {
                    let resolved: Vec<Record> = ids.iter().filter_map(|id| by_id.get(id).cloned()).collect();
                    *t = ToManySlot::Resolved(resolved);
                }
                ToManySlot::UnresolvedCriteria(_) => {
                    if let Some(parent_id) = parent_id {
                        let resolved = by_inverse.get(&parent_id).cloned().unwrap_or_default();
                        *t = ToManySlot::Resolved(resolved);
                    }
                }
                ToManySlot::Resolved(_) => {}
            },
        }
    }
}

fn reapply_nested(record: &mut Record, field: &str, nested_by_id: &HashMap<i64, Record>) {
    if let Some(slot) = record.relation_mut(field) {
        match slot {
            RelationSlot::Many2One(Many2OneSlot::Resolved(Some(inner))) => {
                if let Some(id) = inner.id {
                    if let Some(fresh) = nested_by_id.get(&id) {
                        **inner = fresh.clone();
                    }
                }
            }
            RelationSlot::ToMany(ToManySlot::Resolved(list)) => {
                for item in list.iter_mut() {
                    if let Some(id) = item.id {
                        if let Some(fresh) = nested_by_id.get(&id) {
                            *item = fresh.clone();
                        }
                    }
                }
            }
            _ => {}
        }
    }
}
