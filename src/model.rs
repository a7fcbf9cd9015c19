//! Immutable model descriptors (spec §3). Created at registration, never
//! mutated afterwards.
use std::collections::HashMap;
use std::sync::Arc;

/// Semantic field type, mirroring the closed set in spec §3.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Bytes,
    Selection(Vec<String>),
    Many2One { target: String },
    One2Many { target: String, inverse: String },
    Many2Many { target: String, link_table: Option<String> },
}

impl FieldType {
    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            FieldType::Many2One { .. } | FieldType::One2Many { .. } | FieldType::Many2Many { .. }
        )
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self, FieldType::One2Many { .. } | FieldType::Many2Many { .. })
    }

    pub fn target_model(&self) -> Option<&str> {
        match self {
            FieldType::Many2One { target } => Some(target),
            FieldType::One2Many { target, .. } => Some(target),
            FieldType::Many2Many { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Whether a server-side cascading delete on this relation makes the
    /// transaction journal's delete-inverse unreconstructable (spec §9 Open
    /// Questions, supplemented in SPEC_FULL.md §11).
    pub fn is_cascading(&self) -> bool {
        matches!(self, FieldType::One2Many { .. })
    }
}

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
        }
    }
}

/// Immutable metadata per remote model (spec §3).
#[derive(Clone, Debug)]
pub struct ModelDescriptor {
    pub name: String,
    fields: Arc<HashMap<String, FieldDescriptor>>,
    ordered_fields: Arc<Vec<String>>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        let ordered_fields = fields.iter().map(|f| f.name.clone()).collect();
        let fields = fields.into_iter().map(|f| (f.name.clone(), f)).collect();
        Self {
            name: name.into(),
            fields: Arc::new(fields),
            ordered_fields: Arc::new(ordered_fields),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> &[String] {
        &self.ordered_fields
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Registry of model descriptors, explicit and parameterized per session
/// rather than a global singleton (spec §9 Design Notes).
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Arc<parking_lot::RwLock<HashMap<String, ModelDescriptor>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: ModelDescriptor) {
        self.models.write().insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<ModelDescriptor> {
        self.models.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips_descriptor() {
        let registry = ModelRegistry::new();
        let descriptor = ModelDescriptor::new(
            "res.partner",
            vec![
                FieldDescriptor::new("name", FieldType::Text, false),
                FieldDescriptor::new(
                    "country_id",
                    FieldType::Many2One {
                        target: "res.country".to_string(),
                    },
                    true,
                ),
                FieldDescriptor::new(
                    "child_ids",
                    FieldType::One2Many {
                        target: "res.partner".to_string(),
                        inverse: "parent_id".to_string(),
                    },
                    true,
                ),
            ],
        );
        registry.register(descriptor);
        let found = registry.get("res.partner").unwrap();
        assert!(found.has_field("country_id"));
        assert!(found.field("child_ids").unwrap().field_type.is_to_many());
        assert!(found.field("child_ids").unwrap().field_type.is_cascading());
    }
}
