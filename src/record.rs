//! Record materialization (spec §4.1 J, §3): server payload <-> typed record.
use std::collections::HashMap;

use bigdecimal::BigDecimal;
use serde_json::Value as Json;
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};

use crate::error::Error;
use crate::model::{FieldType, ModelDescriptor};
use crate::relations::RelationSlot;

/// A materialized scalar value, coerced to its semantic type (spec §4.1).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Decimal(BigDecimal),
    Boolean(bool),
    Date(Date),
    Timestamp(OffsetDateTime),
    Bytes(Vec<u8>),
    Selection(String),
    Null,
}

impl FieldValue {
    fn coerce(field_type: &FieldType, raw: &Json) -> Result<Self, Error> {
        if raw.is_null() {
            return Ok(FieldValue::Null);
        }
        // Odoo-family servers represent an absent scalar/relation as `false`.
        if let Json::Bool(false) = raw {
            return Ok(FieldValue::Null);
        }
        match field_type {
            FieldType::Text | FieldType::Selection(_) => Ok(FieldValue::Text(
                raw.as_str().map(|s| s.to_string()).unwrap_or_else(|| raw.to_string()),
            )),
            FieldType::Integer => raw
                .as_i64()
                .map(FieldValue::Integer)
                .ok_or_else(|| coercion_error(field_type, raw)),
            FieldType::Number => raw
                .as_f64()
                .map(FieldValue::Number)
                .ok_or_else(|| coercion_error(field_type, raw)),
            FieldType::Decimal => {
                let text = match raw {
                    Json::String(s) => s.clone(),
                    Json::Number(n) => n.to_string(),
                    _ => return Err(coercion_error(field_type, raw)),
                };
                text.parse::<BigDecimal>().map(FieldValue::Decimal).map_err(|_| coercion_error(field_type, raw))
            }
            FieldType::Boolean => raw
                .as_bool()
                .map(FieldValue::Boolean)
                .ok_or_else(|| coercion_error(field_type, raw)),
            FieldType::Date => {
                let s = raw.as_str().ok_or_else(|| coercion_error(field_type, raw))?;
                let format = time::format_description::parse("[year]-[month]-[day]").unwrap();
                Date::parse(s, &format)
                    .map(FieldValue::Date)
                    .map_err(|_| coercion_error(field_type, raw))
            }
            FieldType::Timestamp => {
                let s = raw.as_str().ok_or_else(|| coercion_error(field_type, raw))?;
                let normalized = if s.contains('T') { s.to_string() } else { s.replacen(' ', "T", 1) + "Z" };
                OffsetDateTime::parse(&normalized, &Rfc3339)
                    .map(FieldValue::Timestamp)
                    .map_err(|_| coercion_error(field_type, raw))
            }
            FieldType::Bytes => {
                let s = raw.as_str().ok_or_else(|| coercion_error(field_type, raw))?;
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
                    .map(FieldValue::Bytes)
                    .map_err(|_| coercion_error(field_type, raw))
            }
            FieldType::Many2One { .. } | FieldType::One2Many { .. } | FieldType::Many2Many { .. } => {
                Err(Error::ProtocolError {
                    message: "relational fields are materialized through the resolution table, not FieldValue".to_string(),
                })
            }
        }
    }

    /// Inverse of `coerce`: round-trips back to the server's wire shape,
    /// ignoring to-one display-name sugar (spec §8 round-trip law).
    pub fn to_json(&self) -> Json {
        match self {
            FieldValue::Text(s) | FieldValue::Selection(s) => Json::String(s.clone()),
            FieldValue::Integer(i) => Json::Number((*i).into()),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
            FieldValue::Decimal(d) => Json::String(d.to_string()),
            FieldValue::Boolean(b) => Json::Bool(*b),
            FieldValue::Date(d) => {
                let format = time::format_description::parse("[year]-[month]-[day]").unwrap();
                Json::String(d.format(&format).unwrap_or_default())
            }
            FieldValue::Timestamp(t) => Json::String(t.format(&Rfc3339).unwrap_or_default()),
            FieldValue::Bytes(b) => Json::String(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b)),
            FieldValue::Null => Json::Bool(false),
        }
    }
}

fn coercion_error(field_type: &FieldType, raw: &Json) -> Error {
    Error::ValidationError {
        message: format!("cannot coerce {raw} into {field_type:?}"),
        traceback: None,
        context: Default::default(),
    }
}

/// A typed view of one server row (spec §3).
#[derive(Clone, Debug)]
pub struct Record {
    pub model: String,
    pub id: Option<i64>,
    scalars: HashMap<String, FieldValue>,
    relations: HashMap<String, RelationSlot>,
    /// Extra keys returned by the server but not declared on the descriptor;
    /// preserved verbatim so they survive a round trip.
    side_bag: HashMap<String, Json>,
}

impl Record {
    /// Materializes one server dict against a model descriptor.
    pub fn from_server_row(descriptor: &ModelDescriptor, row: &serde_json::Map<String, Json>) -> Result<Self, Error> {
        let mut scalars = HashMap::new();
        let mut relations = HashMap::new();
        let mut side_bag = HashMap::new();
        let id = row.get("id").and_then(|v| v.as_i64());

        for (key, raw) in row {
            if key == "id" {
                continue;
            }
            match descriptor.field(key) {
                Some(field) if field.field_type.is_relational() => {
                    relations.insert(key.clone(), RelationSlot::from_raw(&field.field_type, raw, id)?);
                }
                Some(field) => {
                    scalars.insert(key.clone(), FieldValue::coerce(&field.field_type, raw)?);
                }
                None => {
                    side_bag.insert(key.clone(), raw.clone());
                }
            }
        }

        Ok(Self {
            model: descriptor.name.clone(),
            id,
            scalars,
            relations,
            side_bag,
        })
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.scalars.get(field)
    }

    pub fn relation(&self, field: &str) -> Option<&RelationSlot> {
        self.relations.get(field)
    }

    pub fn relation_mut(&mut self, field: &str) -> Option<&mut RelationSlot> {
        self.relations.get_mut(field)
    }

    pub fn side_bag(&self) -> &HashMap<String, Json> {
        &self.side_bag
    }

    /// Clears every relation's resolution state back to unresolved
    /// (spec §4.3: invalidation of a record clears its resolution table).
    pub fn invalidate_relations(&mut self) {
        for slot in self.relations.values_mut() {
            slot.reset_to_unresolved();
        }
    }

    /// Serializes scalar fields back to the server's wire shape.
    pub fn to_server_fields(&self) -> serde_json::Map<String, Json> {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.scalars {
            map.insert(key.clone(), value.to_json());
        }
        for (key, value) in &self.side_bag {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}
