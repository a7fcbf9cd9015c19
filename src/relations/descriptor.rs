//! Relationship descriptors and resolution slots (spec §3, §4.3).
use serde_json::Value as Json;

use crate::error::Error;
use crate::model::FieldType;
use crate::record::Record;

/// many2one resolution slot: `Unresolved(id|null)` -> `Resolved(record|null)`.
#[derive(Clone, Debug)]
pub enum Many2OneSlot {
    Unresolved { id: Option<i64>, display: Option<String> },
    Resolved(Option<Box<Record>>),
}

impl Many2OneSlot {
    pub fn is_null(&self) -> bool {
        match self {
            Many2OneSlot::Unresolved { id, .. } => id.is_none(),
            Many2OneSlot::Resolved(r) => r.is_none(),
        }
    }

    pub fn unresolved_id(&self) -> Option<i64> {
        match self {
            Many2OneSlot::Unresolved { id, .. } => *id,
            Many2OneSlot::Resolved(r) => r.as_ref().and_then(|r| r.id),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Many2OneSlot::Resolved(_))
    }

    pub fn resolved(&self) -> Option<&Record> {
        match self {
            Many2OneSlot::Resolved(r) => r.as_deref(),
            Many2OneSlot::Unresolved { .. } => None,
        }
    }
}

/// Criteria used to group many parent records into one follow-up read when
/// a to-many relation is resolved via its inverse key rather than a known
/// id list (spec §4.3 prefetch planner).
#[derive(Clone, Debug)]
pub struct InverseCriteria {
    pub inverse_field: String,
    pub parent_id: i64,
}

#[derive(Clone, Debug)]
pub enum ToManySlot {
    UnresolvedIds(Vec<i64>),
    UnresolvedCriteria(InverseCriteria),
    Resolved(Vec<Record>),
}

impl ToManySlot {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ToManySlot::Resolved(_))
    }

    pub fn resolved(&self) -> Option<&[Record]> {
        match self {
            ToManySlot::Resolved(records) => Some(records),
            _ => None,
        }
    }

    pub fn unresolved_ids(&self) -> Vec<i64> {
        match self {
            ToManySlot::UnresolvedIds(ids) => ids.clone(),
            ToManySlot::Resolved(records) => records.iter().filter_map(|r| r.id).collect(),
            ToManySlot::UnresolvedCriteria(_) => vec![],
        }
    }
}

#[derive(Clone, Debug)]
pub enum RelationSlot {
    Many2One(Many2OneSlot),
    ToMany(ToManySlot),
}

impl RelationSlot {
    /// `parent_id` is this row's own id, used by a one2many field to resolve
    /// via the inverse key (`parent_id in {…}`, spec §4.3's grouped prefetch)
    /// rather than the id list the wire payload already carries — an unsaved
    /// record with no id yet (`parent_id: None`) falls back to the id list.
    pub fn from_raw(field_type: &FieldType, raw: &Json, parent_id: Option<i64>) -> Result<Self, Error> {
        match field_type {
            FieldType::Many2One { .. } => Ok(RelationSlot::Many2One(match raw {
                Json::Bool(false) | Json::Null => Many2OneSlot::Unresolved { id: None, display: None },
                Json::Array(pair) if pair.len() == 2 => Many2OneSlot::Unresolved {
                    id: pair[0].as_i64(),
                    display: pair[1].as_str().map(|s| s.to_string()),
                },
                Json::Number(_) => Many2OneSlot::Unresolved {
                    id: raw.as_i64(),
                    display: None,
                },
                other => {
                    return Err(Error::ProtocolError {
                        message: format!("unexpected many2one wire shape: {other}"),
                    })
                }
            })),
            FieldType::One2Many { inverse, .. } => {
                match parent_id {
                    Some(parent_id) => Ok(RelationSlot::ToMany(ToManySlot::UnresolvedCriteria(InverseCriteria {
                        inverse_field: inverse.clone(),
                        parent_id,
                    }))),
                    None => Ok(RelationSlot::ToMany(ToManySlot::UnresolvedIds(parse_id_list(raw)?))),
                }
            }
            FieldType::Many2Many { .. } => Ok(RelationSlot::ToMany(ToManySlot::UnresolvedIds(parse_id_list(raw)?))),
            _ => Err(Error::ProtocolError {
                message: "from_raw called on a non-relational field type".to_string(),
            }),
        }
    }

    pub fn reset_to_unresolved(&mut self) {
        match self {
            RelationSlot::Many2One(slot) => {
                let id = slot.unresolved_id();
                *slot = Many2OneSlot::Unresolved { id, display: None };
            }
            RelationSlot::ToMany(slot) => {
                let ids = slot.unresolved_ids();
                *slot = ToManySlot::UnresolvedIds(ids);
            }
        }
    }
}

fn parse_id_list(raw: &Json) -> Result<Vec<i64>, Error> {
    match raw {
        Json::Bool(false) | Json::Null => Ok(vec![]),
        Json::Array(values) => Ok(values.iter().filter_map(|v| v.as_i64()).collect()),
        other => Err(Error::ProtocolError {
            message: format!("unexpected to-many wire shape: {other}"),
        }),
    }
}

/// Wire commands for to-many mutation shortcuts (spec §4.3): the server's
/// tuple-command protocol `(code, id, payload)`.
#[derive(Clone, Debug, PartialEq)]
pub enum TupleCommand {
    Link(i64),
    Unlink(i64),
    Replace(Vec<i64>),
    Clear,
}

impl TupleCommand {
    /// Odoo's integer command codes: 4=link, 3=unlink, 6=replace, 5=clear.
    pub fn to_wire(&self) -> Json {
        match self {
            TupleCommand::Link(id) => Json::Array(vec![Json::from(4), Json::from(*id), Json::from(0)]),
            TupleCommand::Unlink(id) => Json::Array(vec![Json::from(3), Json::from(*id), Json::from(0)]),
            TupleCommand::Replace(ids) => {
                Json::Array(vec![Json::from(6), Json::from(0), Json::Array(ids.iter().map(|i| Json::from(*i)).collect())])
            }
            TupleCommand::Clear => Json::Array(vec![Json::from(5), Json::from(0), Json::from(0)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn many2one_pair_captures_id_and_display() {
        let raw = serde_json::json!([3, "Belgium"]);
        let slot = RelationSlot::from_raw(
            &FieldType::Many2One {
                target: "res.country".to_string(),
            },
            &raw,
            None,
        )
        .unwrap();
        match slot {
            RelationSlot::Many2One(Many2OneSlot::Unresolved { id, display }) => {
                assert_eq!(id, Some(3));
                assert_eq!(display.as_deref(), Some("Belgium"));
            }
            _ => panic!("expected many2one slot"),
        }
    }

    #[test]
    fn one2many_with_a_known_parent_id_resolves_via_inverse_key() {
        let field_type = FieldType::One2Many {
            target: "res.partner".to_string(),
            inverse: "parent_id".to_string(),
        };
        let raw = serde_json::json!([10, 11]);
        let slot = RelationSlot::from_raw(&field_type, &raw, Some(7)).unwrap();
        match slot {
            RelationSlot::ToMany(ToManySlot::UnresolvedCriteria(criteria)) => {
                assert_eq!(criteria.inverse_field, "parent_id");
                assert_eq!(criteria.parent_id, 7);
            }
            _ => panic!("expected an unresolved-criteria slot"),
        }
    }

    #[test]
    fn one2many_without_a_parent_id_falls_back_to_the_wire_id_list() {
        let field_type = FieldType::One2Many {
            target: "res.partner".to_string(),
            inverse: "parent_id".to_string(),
        };
        let raw = serde_json::json!([10, 11]);
        let slot = RelationSlot::from_raw(&field_type, &raw, None).unwrap();
        match slot {
            RelationSlot::ToMany(ToManySlot::UnresolvedIds(ids)) => assert_eq!(ids, vec![10, 11]),
            _ => panic!("expected an unresolved-ids slot"),
        }
    }

    #[test]
    fn many2many_always_resolves_via_id_list() {
        let field_type = FieldType::Many2Many {
            target: "res.tag".to_string(),
            link_table: None,
        };
        let raw = serde_json::json!([1, 2, 3]);
        let slot = RelationSlot::from_raw(&field_type, &raw, Some(7)).unwrap();
        match slot {
            RelationSlot::ToMany(ToManySlot::UnresolvedIds(ids)) => assert_eq!(ids, vec![1, 2, 3]),
            _ => panic!("expected an unresolved-ids slot"),
        }
    }

    #[test]
    fn tuple_commands_emit_odoo_codes() {
        assert_eq!(TupleCommand::Link(5).to_wire(), serde_json::json!([4, 5, 0]));
        assert_eq!(TupleCommand::Unlink(5).to_wire(), serde_json::json!([3, 5, 0]));
        assert_eq!(TupleCommand::Replace(vec![1, 2]).to_wire(), serde_json::json!([6, 0, [1, 2]]));
        assert_eq!(TupleCommand::Clear.to_wire(), serde_json::json!([5, 0, 0]));
    }
}
