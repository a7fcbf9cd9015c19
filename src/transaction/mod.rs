//! Transaction manager (spec §4.5, component I): a client-side compensating
//! journal, not a true distributed transaction — the server has already
//! committed each RPC by the time it returns.
pub mod journal;
pub mod savepoint;

pub use journal::JournalEntry;
pub use savepoint::SavepointHandle;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::error::Error;
use crate::model::ModelRegistry;
use crate::retry::RetryManager;
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Active,
    Committed,
    RolledBack,
    Aborted,
}

/// How many scope-level retry attempts a `DeadlockError` gets before the
/// error surfaces (spec §4.5).
#[derive(Clone, Debug)]
pub struct DeadlockRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DeadlockRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// A nested, task-bound scope over the session's writes (spec §3, §4.5).
/// Cloning shares the same journal and status (nested scopes); cross-task
/// use of the same scope is rejected rather than silently racing.
#[derive(Clone)]
pub struct TransactionScope {
    session: Arc<Session>,
    retry: Option<Arc<RetryManager>>,
    /// Consulted by `delete` to decide whether a record's relation fields
    /// make the delete's inverse unreconstructable. `None` (no registry
    /// wired in) means every delete is journaled as normally reversible.
    registry: Option<ModelRegistry>,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
    status: Arc<Mutex<Status>>,
    owner_task: tokio::task::Id,
    next_savepoint_id: Arc<AtomicU64>,
    /// Set once any non-idempotent side effect has been observed, after
    /// which a deadlock-triggered whole-scope retry is no longer safe
    /// (spec §4.5).
    side_effect_emitted: Arc<std::sync::atomic::AtomicBool>,
}

impl TransactionScope {
    /// Enters a new top-level scope, bound to the calling task.
    pub fn enter(session: Arc<Session>, retry: Option<Arc<RetryManager>>) -> Result<Self, Error> {
        Self::enter_with_registry(session, retry, None)
    }

    /// Same as [`Self::enter`], but wires a model registry in so `delete`
    /// can recognize cascading relation fields and journal an
    /// [`JournalEntry::Irreversible`] entry instead of a reversible `Delete`.
    pub fn enter_with_registry(session: Arc<Session>, retry: Option<Arc<RetryManager>>, registry: Option<ModelRegistry>) -> Result<Self, Error> {
        let owner_task = tokio::task::id();
        Ok(Self {
            session,
            retry,
            registry,
            journal: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(Mutex::new(Status::Active)),
            owner_task,
            next_savepoint_id: Arc::new(AtomicU64::new(1)),
            side_effect_emitted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Enters a nested scope sharing this scope's journal and task binding
    /// (spec §4.5 step 1: nested scopes share the same journal via parent
    /// linkage).
    pub fn nested(&self) -> Result<Self, Error> {
        self.check_owner()?;
        Ok(self.clone())
    }

    fn check_owner(&self) -> Result<(), Error> {
        if tokio::task::id() != self.owner_task {
            return Err(Error::TransactionError {
                message: "transaction scope used from a task other than the one that created it".to_string(),
            });
        }
        if *self.status.lock() != Status::Active {
            return Err(Error::TransactionError {
                message: "transaction scope is no longer active".to_string(),
            });
        }
        Ok(())
    }

    /// `create(model, values)`: writes through the session and journals the
    /// new id with inverse `delete(id)`.
    pub async fn create(&self, model: &str, values: Json) -> Result<i64, Error> {
        self.check_owner()?;
        let result = self
            .session
            .execute_kw(model, "create", Json::Array(vec![values]), Json::Object(Default::default()))
            .await?;
        let id = result.as_i64().ok_or_else(|| Error::ProtocolError {
            message: "create did not return an id".to_string(),
        })?;
        self.side_effect_emitted.store(true, Ordering::SeqCst);
        self.journal.lock().push(JournalEntry::Create {
            model: model.to_string(),
            id,
        });
        Ok(id)
    }

    /// `update(model, id, changes)`: reads the affected fields' current
    /// values before writing, journalling `write(id, before)` as the
    /// inverse.
    pub async fn update(&self, model: &str, id: i64, changes: Json) -> Result<(), Error> {
        self.check_owner()?;
        let fields: Vec<String> = changes
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let before = self.read_one(model, id, &fields).await?;
        self.session
            .execute_kw(model, "write", Json::Array(vec![Json::Array(vec![Json::from(id)]), changes]), Json::Object(Default::default()))
            .await?;
        self.side_effect_emitted.store(true, Ordering::SeqCst);
        self.journal.lock().push(JournalEntry::Update {
            model: model.to_string(),
            id,
            before,
        });
        Ok(())
    }

    /// `delete(model, id)`: captures the whole record before unlinking,
    /// journalling `create(full-record)` as a best-effort inverse — unless
    /// the record populates a field the registry marks cascading, in which
    /// case the entry is journaled as `Irreversible` instead (spec §9 Open
    /// Questions, supplemented in SPEC_FULL.md §11).
    pub async fn delete(&self, model: &str, id: i64) -> Result<(), Error> {
        self.check_owner()?;
        let record = self.read_one(model, id, &[]).await?;
        self.session
            .execute_kw(model, "unlink", Json::Array(vec![Json::Array(vec![Json::from(id)])]), Json::Object(Default::default()))
            .await?;
        self.side_effect_emitted.store(true, Ordering::SeqCst);
        let entry = if self.record_is_cascading(model, &record) {
            JournalEntry::Irreversible { model: model.to_string(), id }
        } else {
            JournalEntry::Delete {
                model: model.to_string(),
                id,
                record,
            }
        };
        self.journal.lock().push(entry);
        Ok(())
    }

    /// Journals `entries` as one grouped entry (spec §4.4/§4.5): used by the
    /// batch engine so a whole chunk's writes roll back together instead of
    /// as independent top-level entries.
    pub fn journal_group(&self, entries: Vec<JournalEntry>) -> Result<(), Error> {
        self.check_owner()?;
        if entries.is_empty() {
            return Ok(());
        }
        self.side_effect_emitted.store(true, Ordering::SeqCst);
        self.journal.lock().push(JournalEntry::Group(entries));
        Ok(())
    }

    /// Builds the journal entry a standalone `delete` would have built for
    /// `record`, without issuing the `unlink` RPC itself — used by the batch
    /// engine, which has already unlinked the whole chunk in one call and
    /// only needs the per-record entries to group (spec §4.4/§4.5).
    pub(crate) fn classify_delete_entry(&self, model: &str, id: i64, record: Json) -> JournalEntry {
        if self.record_is_cascading(model, &record) {
            JournalEntry::Irreversible { model: model.to_string(), id }
        } else {
            JournalEntry::Delete {
                model: model.to_string(),
                id,
                record,
            }
        }
    }

    fn record_is_cascading(&self, model: &str, record: &Json) -> bool {
        match &self.registry {
            Some(registry) => JournalEntry::record_is_cascading(model, record, |model, field| {
                registry
                    .get(model)
                    .and_then(|descriptor| descriptor.field(field).map(|f| f.field_type.is_cascading()))
                    .unwrap_or(false)
            }),
            None => false,
        }
    }

    async fn read_one(&self, model: &str, id: i64, fields: &[String]) -> Result<Json, Error> {
        let fields_arg = if fields.is_empty() {
            Json::Array(vec![])
        } else {
            serde_json::to_value(fields).unwrap()
        };
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("fields".to_string(), fields_arg);
        let rows = self
            .session
            .execute_kw(model, "read", Json::Array(vec![Json::Array(vec![Json::from(id)])]), Json::Object(kwargs))
            .await?;
        rows.as_array()
            .and_then(|rows| rows.first().cloned())
            .ok_or_else(|| Error::NotFoundError {
                context: crate::error::ErrorContext::new(model, "read").with_args_summary(format!("id={id}")),
            })
    }

    /// `savepoint(name)` (spec §4.5): returns a handle over the journal's
    /// current length.
    pub fn savepoint(&self, _name: impl Into<String>) -> Result<SavepointHandle, Error> {
        self.check_owner()?;
        let name_id = self.next_savepoint_id.fetch_add(1, Ordering::SeqCst);
        Ok(SavepointHandle {
            name_id,
            mark: self.journal.lock().len(),
        })
    }

    /// `release(handle)`: discards the handle without touching the journal.
    pub fn release(&self, _handle: SavepointHandle) -> Result<(), Error> {
        self.check_owner()
    }

    /// `rollback(handle)`: issues inverses for entries recorded after the
    /// mark, in reverse order, then truncates the journal to the mark
    /// (spec §4.5). Returns the old-id→new-id map for any deletes whose
    /// inverse create was re-issued with a server-assigned id.
    pub async fn rollback_to(&self, handle: SavepointHandle) -> Result<ReconciliationMap, Error> {
        self.check_owner()?;
        let entries: Vec<JournalEntry> = {
            let mut journal = self.journal.lock();
            let tail = journal.split_off(handle.mark);
            tail
        };
        self.issue_inverses(entries).await
    }

    /// Normal exit: discards the journal (spec §4.5 step 3).
    pub fn commit(self) -> Result<(), Error> {
        self.check_owner()?;
        self.journal.lock().clear();
        *self.status.lock() = Status::Committed;
        Ok(())
    }

    /// Exceptional exit: issues every journalled inverse in reverse order.
    /// A failed inverse is recorded; if any fail, the scope ends `aborted`
    /// and surfaces `RollbackError` (spec §4.5 step 4).
    pub async fn rollback(self) -> Result<ReconciliationMap, Error> {
        self.check_owner()?;
        let entries: Vec<JournalEntry> = self.journal.lock().drain(..).collect();
        let result = self.issue_inverses(entries).await;
        *self.status.lock() = if result.is_ok() { Status::RolledBack } else { Status::Aborted };
        result
    }

    async fn issue_inverses(&self, entries: Vec<JournalEntry>) -> Result<ReconciliationMap, Error> {
        let mut reconciliation = ReconciliationMap::default();
        let mut unrecovered = vec![];
        for entry in entries.iter().rev() {
            self.issue_inverses_for_entry(entry, &mut reconciliation, &mut unrecovered).await;
        }
        if unrecovered.is_empty() {
            Ok(reconciliation)
        } else {
            Err(Error::RollbackError { unrecovered })
        }
    }

    /// Recurses into `Group` entries so a batch chunk's members invert
    /// together, in reverse order, as part of the same rollback pass.
    fn issue_inverses_for_entry<'a>(
        &'a self,
        entry: &'a JournalEntry,
        reconciliation: &'a mut ReconciliationMap,
        unrecovered: &'a mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let JournalEntry::Group(members) = entry {
                for member in members.iter().rev() {
                    self.issue_inverses_for_entry(member, reconciliation, unrecovered).await;
                }
                return;
            }
            let outcome = self.issue_inverse(entry).await;
            match outcome {
                Ok(Some((old_id, new_id))) => reconciliation.insert(entry.model().to_string(), old_id, new_id),
                Ok(None) => {}
                Err(e) => unrecovered.push(format!("{}({}): {e}", entry.model(), describe(entry))),
            }
        })
    }

    async fn issue_inverse(&self, entry: &JournalEntry) -> Result<Option<(i64, i64)>, Error> {
        match entry {
            JournalEntry::Create { model, id } => {
                self.session
                    .execute_kw(model, "unlink", Json::Array(vec![Json::Array(vec![Json::from(*id)])]), Json::Object(Default::default()))
                    .await?;
                Ok(None)
            }
            JournalEntry::Update { model, id, before } => {
                self.session
                    .execute_kw(
                        model,
                        "write",
                        Json::Array(vec![Json::Array(vec![Json::from(*id)]), before.clone()]),
                        Json::Object(Default::default()),
                    )
                    .await?;
                Ok(None)
            }
            JournalEntry::Delete { model, id, record } => {
                let mut values = record.as_object().cloned().unwrap_or_default();
                values.remove("id");
                let result = self
                    .session
                    .execute_kw(model, "create", Json::Array(vec![Json::Object(values)]), Json::Object(Default::default()))
                    .await?;
                let new_id = result.as_i64().ok_or_else(|| Error::ProtocolError {
                    message: "rollback re-create did not return an id".to_string(),
                })?;
                Ok(Some((*id, new_id)))
            }
            JournalEntry::Irreversible { model, id } => Err(Error::TransactionError {
                message: format!("{model}({id}) was journaled as irreversible: a cascading relation field means the server already removed its children, so rollback cannot re-create it"),
            }),
            JournalEntry::Group(_) => unreachable!("Group entries are flattened by issue_inverses_for_entry"),
        }
    }

    /// Runs `body` under a fresh scope, retrying the whole scope on a
    /// deadlock-classified error up to `policy.max_attempts` times,
    /// provided no non-idempotent side effect has been emitted yet
    /// (spec §4.5).
    pub async fn run_with_deadlock_retry<T, F, Fut>(
        session: Arc<Session>,
        retry: Option<Arc<RetryManager>>,
        policy: &DeadlockRetryPolicy,
        mut body: F,
    ) -> Result<T, Error>
    where
        F: FnMut(TransactionScope) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        Self::run_with_deadlock_retry_and_registry(session, retry, None, policy, body).await
    }

    /// Same as [`Self::run_with_deadlock_retry`], threading a model registry
    /// into every attempt's scope so cascading deletes are recognized.
    pub async fn run_with_deadlock_retry_and_registry<T, F, Fut>(
        session: Arc<Session>,
        retry: Option<Arc<RetryManager>>,
        registry: Option<ModelRegistry>,
        policy: &DeadlockRetryPolicy,
        mut body: F,
    ) -> Result<T, Error>
    where
        F: FnMut(TransactionScope) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let scope = TransactionScope::enter_with_registry(session.clone(), retry.clone(), registry.clone())?;
            let side_effect_flag = scope.side_effect_emitted.clone();
            match body(scope).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let unsafe_to_retry = side_effect_flag.load(Ordering::SeqCst);
                    if is_deadlock(&err) && !unsafe_to_retry && attempt < policy.max_attempts {
                        let delay = crate::retry::strategy::delay_for(
                            crate::retry::RetryStrategyKind::Exponential,
                            attempt,
                            policy.base_delay,
                            policy.max_delay,
                            0.25,
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn describe(entry: &JournalEntry) -> &'static str {
    match entry {
        JournalEntry::Create { .. } => "create",
        JournalEntry::Update { .. } => "update",
        JournalEntry::Delete { .. } => "delete",
        JournalEntry::Irreversible { .. } => "irreversible-delete",
        JournalEntry::Group(_) => "batch-chunk-group",
    }
}

fn is_deadlock(error: &Error) -> bool {
    match error {
        Error::InternalError { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("deadlock") || lower.contains("serializ")
        }
        _ => false,
    }
}

/// Old-id→new-id map produced when rollback re-creates a previously
/// deleted record under a server-assigned id (spec §9 Open Questions,
/// supplemented in SPEC_FULL.md §11). Downstream references to the old id
/// are the caller's responsibility to reconcile; this map only records what
/// happened.
#[derive(Default, Debug, Clone)]
pub struct ReconciliationMap {
    entries: Vec<(String, i64, i64)>,
}

impl ReconciliationMap {
    fn insert(&mut self, model: String, old_id: i64, new_id: i64) {
        self.entries.push((model, old_id, new_id));
    }

    pub fn get(&self, model: &str, old_id: i64) -> Option<i64> {
        self.entries.iter().find(|(m, o, _)| m == model && *o == old_id).map(|(_, _, n)| *n)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
