//! Operation journal (spec §4.5): reversible write entries recorded as the
//! scope issues them, used to compute compensating rollback operations.
use serde_json::Value as Json;

/// One journalled write and the information needed to invert it.
#[derive(Clone, Debug)]
pub enum JournalEntry {
    Create { model: String, id: i64 },
    Update { model: String, id: i64, before: Json },
    /// Best-effort inverse: the server may renumber ids on re-create.
    Delete { model: String, id: i64, record: Json },
    /// A delete whose record populated a cascading relation field: the
    /// server will already have removed the cascaded children by the time
    /// this entry is journaled, so no inverse is attempted at all (spec §9
    /// Open Questions, supplemented in SPEC_FULL.md §11).
    Irreversible { model: String, id: i64 },
    /// One batch chunk's writes, journaled as a single entry whose members
    /// are inverted together in reverse order (spec §4.5: "their writes
    /// journal as a single grouped entry per chunk").
    Group(Vec<JournalEntry>),
}

impl JournalEntry {
    pub fn model(&self) -> &str {
        match self {
            JournalEntry::Create { model, .. } => model,
            JournalEntry::Update { model, .. } => model,
            JournalEntry::Delete { model, .. } => model,
            JournalEntry::Irreversible { model, .. } => model,
            JournalEntry::Group(entries) => entries.first().map(|e| e.model()).unwrap_or(""),
        }
    }

    /// Whether `record`'s populated fields include a relation that
    /// `is_cascading_field(model, field)` flags as cascading, decided at
    /// delete time to choose between journaling a `Delete` or an
    /// `Irreversible` entry.
    pub fn record_is_cascading(model: &str, record: &Json, is_cascading_field: impl Fn(&str, &str) -> bool) -> bool {
        record
            .as_object()
            .map(|fields| fields.keys().any(|field| is_cascading_field(model, field)))
            .unwrap_or(false)
    }
}
