//! Chunked concurrent bulk operations (spec §4.4, component H).
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::Semaphore;

use crate::config::BatchConfig;
use crate::error::Error;
use crate::retry::RetryManager;
use crate::session::Session;
use crate::transaction::{JournalEntry, TransactionScope};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    /// First failing chunk cancels not-yet-started chunks (default).
    StopOnError,
    /// Every chunk runs regardless of earlier failures.
    ContinueOnError,
}

/// What kind of RPC a batch is issuing, passed to the progress sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    fn label(self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

/// Invoked after each chunk completes with `(processed, total, op-kind)`.
/// Ordering under concurrency is unspecified; `processed` is monotonic.
pub trait ProgressSink: Send + Sync {
    fn on_chunk(&self, processed: u64, total: u64, op: OpKind);
}

/// Aggregate result of a bulk operation (spec §4.4). `failed` is keyed by the
/// record's index in the original input list, not by chunk — a multi-record
/// chunk that fails under `ContinueOnError` is retried record-by-record so a
/// single bad record doesn't take its chunk-mates down with it.
#[derive(Debug, Default)]
pub struct BatchOutcome<T> {
    pub successful: Vec<T>,
    pub failed: Vec<(usize, Error)>,
    /// Set when `StopOnError` aborted early; callers with an active
    /// transaction scope should roll it back on seeing this.
    pub rollback_requested: bool,
}

impl<T> BatchOutcome<T> {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }
}

fn chunk_vec<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    items.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect()
}

fn chunk_starts<T>(chunks: &[Vec<T>]) -> Vec<usize> {
    let mut starts = Vec::with_capacity(chunks.len());
    let mut offset = 0;
    for chunk in chunks {
        starts.push(offset);
        offset += chunk.len();
    }
    starts
}

fn stale_chunk_error(message: impl Into<String>) -> Error {
    Error::TransactionError { message: message.into() }
}

/// Runs every chunk through `executor`, which resolves each record in its
/// chunk to a `(record-index, Result)` pair — record-level, not chunk-level,
/// so a partial chunk failure under `ContinueOnError` only marks the records
/// that actually failed (spec §4.4, §7).
async fn run_indexed_chunks<T, F, Fut>(
    chunks: Vec<Vec<Json>>,
    config: &BatchConfig,
    mode: BatchMode,
    op: OpKind,
    progress: Option<Arc<dyn ProgressSink>>,
    executor: F,
) -> BatchOutcome<T>
where
    T: Send + 'static,
    F: Fn(usize, Vec<Json>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Vec<(usize, Result<T, Error>)>> + Send,
{
    let starts = chunk_starts(&chunks);
    let total = chunks.iter().map(|c| c.len() as u64).sum::<u64>();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let executor = Arc::new(executor);
    let processed = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mut handles = vec![];
    for (chunk_index, chunk) in chunks.into_iter().enumerate() {
        let chunk_start = starts[chunk_index];
        let semaphore = semaphore.clone();
        let executor = executor.clone();
        let progress = progress.clone();
        let processed_counter = processed.clone();
        let cancelled = cancelled.clone();
        let chunk_len = chunk.len() as u64;
        handles.push(tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (0..chunk_len as usize)
                        .map(|i| (chunk_start + i, Err(stale_chunk_error("batch semaphore closed before this chunk could run"))))
                        .collect::<Vec<_>>();
                }
            };
            if mode == BatchMode::StopOnError && cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                drop(permit);
                return (0..chunk_len as usize)
                    .map(|i| (chunk_start + i, Err(stale_chunk_error("chunk cancelled after an earlier chunk failed"))))
                    .collect::<Vec<_>>();
            }
            let results = executor(chunk_start, chunk).await;
            drop(permit);
            let now = processed_counter.fetch_add(chunk_len, std::sync::atomic::Ordering::SeqCst) + chunk_len;
            if let Some(sink) = &progress {
                sink.on_chunk(now, total, op);
            }
            if mode == BatchMode::StopOnError && results.iter().any(|(_, r)| r.is_err()) {
                cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            results
        }));
    }

    let mut indexed: Vec<(usize, Result<T, Error>)> = vec![];
    for handle in handles {
        if let Ok(results) = handle.await {
            indexed.extend(results);
        }
    }
    indexed.sort_by_key(|(i, _)| *i);

    let mut outcome = BatchOutcome::default();
    for (index, result) in indexed {
        match result {
            Ok(value) => outcome.successful.push(value),
            Err(e) => {
                outcome.failed.push((index, e));
                if mode == BatchMode::StopOnError {
                    outcome.rollback_requested = true;
                }
            }
        }
    }
    outcome
}

async fn run_rpc<F, Fut>(retry: &Option<Arc<RetryManager>>, model: &str, label: &'static str, run: F) -> Result<Json, Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Json, Error>>,
{
    match retry {
        Some(retry) => retry.invoke(model, label, run).await,
        None => run().await,
    }
}

async fn whole_create(session: &Arc<Session>, retry: &Option<Arc<RetryManager>>, model: &str, records: Vec<Json>) -> Result<Vec<i64>, Error> {
    let result = run_rpc(retry, model, "bulk_create", || {
        let session = session.clone();
        let model = model.to_string();
        let records = records.clone();
        async move { session.execute_kw(&model, "create", Json::Array(vec![Json::Array(records)]), Json::Object(Default::default())).await }
    })
    .await?;
    match result {
        Json::Array(ids) => Ok(ids.into_iter().filter_map(|v| v.as_i64()).collect()),
        Json::Number(n) => Ok(vec![n.as_i64().unwrap_or_default()]),
        _ => Err(Error::ProtocolError {
            message: "create did not return an id or id list".to_string(),
        }),
    }
}

async fn single_create(session: &Arc<Session>, retry: &Option<Arc<RetryManager>>, model: &str, record: Json) -> Result<i64, Error> {
    let ids = whole_create(session, retry, model, vec![record]).await?;
    ids.into_iter().next().ok_or_else(|| Error::ProtocolError {
        message: "create did not return an id".to_string(),
    })
}

async fn whole_write(session: &Arc<Session>, retry: &Option<Arc<RetryManager>>, model: &str, ids: &[i64], changes: &Json) -> Result<(), Error> {
    let id_values: Vec<Json> = ids.iter().map(|i| Json::from(*i)).collect();
    run_rpc(retry, model, "bulk_update", || {
        let session = session.clone();
        let model = model.to_string();
        let id_values = id_values.clone();
        let changes = changes.clone();
        async move { session.execute_kw(&model, "write", Json::Array(vec![Json::Array(id_values), changes]), Json::Object(Default::default())).await }
    })
    .await?;
    Ok(())
}

async fn whole_unlink(session: &Arc<Session>, retry: &Option<Arc<RetryManager>>, model: &str, ids: &[i64]) -> Result<(), Error> {
    let id_values: Vec<Json> = ids.iter().map(|i| Json::from(*i)).collect();
    run_rpc(retry, model, "bulk_delete", || {
        let session = session.clone();
        let model = model.to_string();
        let id_values = id_values.clone();
        async move { session.execute_kw(&model, "unlink", Json::Array(vec![Json::Array(id_values)]), Json::Object(Default::default())).await }
    })
    .await?;
    Ok(())
}

/// `read(ids, fields)` keyed by id, used to capture pre-write state for
/// journalling before a chunked `write`/`unlink` is issued.
async fn read_by_id(session: &Arc<Session>, model: &str, ids: &[i64], fields: &[String]) -> Result<HashMap<i64, Json>, Error> {
    let fields_arg = if fields.is_empty() { Json::Array(vec![]) } else { serde_json::to_value(fields).unwrap() };
    let mut kwargs = serde_json::Map::new();
    kwargs.insert("fields".to_string(), fields_arg);
    let id_values: Vec<Json> = ids.iter().map(|i| Json::from(*i)).collect();
    let result = session
        .execute_kw(model, "read", Json::Array(vec![Json::Array(id_values)]), Json::Object(kwargs))
        .await?;
    let rows = result.as_array().cloned().ok_or_else(|| Error::ProtocolError {
        message: "read did not return an array".to_string(),
    })?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.as_object().and_then(|m| m.get("id")).and_then(|v| v.as_i64()).map(|id| (id, row.clone())))
        .collect())
}

fn chunk_ids(chunk: &[Json]) -> Vec<i64> {
    chunk.iter().filter_map(|v| v.as_i64()).collect()
}

/// `bulk_create(model, records, chunk_size?)` (spec §4.4): each chunk issues
/// one `create` RPC with a list payload. When `scope` is set, every chunk's
/// created ids journal as a single grouped entry (spec §4.4/§4.5). On
/// `ContinueOnError`, a whole-chunk failure is retried one record at a time
/// so only the records that actually fail are reported failed (spec §7).
pub async fn bulk_create(
    session: Arc<Session>,
    retry: Option<Arc<RetryManager>>,
    model: impl Into<String>,
    records: Vec<Json>,
    config: &BatchConfig,
    mode: BatchMode,
    scope: Option<TransactionScope>,
    progress: Option<Arc<dyn ProgressSink>>,
) -> BatchOutcome<i64> {
    let model = model.into();
    let chunks = chunk_vec(&records, config.max_chunk_size);
    run_indexed_chunks(chunks, config, mode, OpKind::Create, progress, move |chunk_start, chunk| {
        let session = session.clone();
        let retry = retry.clone();
        let model = model.clone();
        let scope = scope.clone();
        async move {
            match whole_create(&session, &retry, &model, chunk.clone()).await {
                Ok(ids) => {
                    if let Some(scope) = &scope {
                        let entries = ids.iter().map(|id| JournalEntry::Create { model: model.clone(), id: *id }).collect();
                        if let Err(e) = scope.journal_group(entries) {
                            return (0..chunk.len()).map(|i| (chunk_start + i, Err(group_journal_error(&e)))).collect();
                        }
                    }
                    ids.into_iter().enumerate().map(|(i, id)| (chunk_start + i, Ok(id))).collect()
                }
                Err(e) if mode == BatchMode::ContinueOnError => {
                    let mut out = vec![];
                    let mut entries = vec![];
                    for (i, record) in chunk.into_iter().enumerate() {
                        match single_create(&session, &retry, &model, record).await {
                            Ok(id) => {
                                entries.push(JournalEntry::Create { model: model.clone(), id });
                                out.push((chunk_start + i, Ok(id)));
                            }
                            Err(err) => out.push((chunk_start + i, Err(err))),
                        }
                    }
                    if let Some(scope) = &scope {
                        let _ = scope.journal_group(entries);
                    }
                    let _ = e;
                    out
                }
                Err(e) => {
                    let len = chunk.len();
                    fan_out_error(chunk_start, len, e)
                }
            }
        }
    })
    .await
}

/// `bulk_update`: grouped ids with identical changes are written in one
/// `write` RPC per chunk (spec §4.4). When `scope` is set, each chunk's
/// pre-write state is read and journaled as one grouped entry.
pub async fn bulk_update(
    session: Arc<Session>,
    retry: Option<Arc<RetryManager>>,
    model: impl Into<String>,
    ids: Vec<i64>,
    changes: Json,
    config: &BatchConfig,
    mode: BatchMode,
    scope: Option<TransactionScope>,
    progress: Option<Arc<dyn ProgressSink>>,
) -> BatchOutcome<i64> {
    let model = model.into();
    let id_values: Vec<Json> = ids.iter().map(|i| Json::from(*i)).collect();
    let chunks = chunk_vec(&id_values, config.max_chunk_size);
    let fields: Vec<String> = changes.as_object().map(|m| m.keys().cloned().collect()).unwrap_or_default();
    run_indexed_chunks(chunks, config, mode, OpKind::Update, progress, move |chunk_start, chunk| {
        let session = session.clone();
        let retry = retry.clone();
        let model = model.clone();
        let changes = changes.clone();
        let fields = fields.clone();
        let scope = scope.clone();
        async move {
            let chunk_id_list = chunk_ids(&chunk);
            let before = if scope.is_some() {
                match read_by_id(&session, &model, &chunk_id_list, &fields).await {
                    Ok(map) => map,
                    Err(e) => return fan_out_error(chunk_start, chunk.len(), e),
                }
            } else {
                HashMap::new()
            };
            match whole_write(&session, &retry, &model, &chunk_id_list, &changes).await {
                Ok(()) => {
                    if let Some(scope) = &scope {
                        let entries = chunk_id_list
                            .iter()
                            .filter_map(|id| before.get(id).map(|b| JournalEntry::Update { model: model.clone(), id: *id, before: b.clone() }))
                            .collect();
                        if let Err(e) = scope.journal_group(entries) {
                            return (0..chunk_id_list.len()).map(|i| (chunk_start + i, Err(group_journal_error(&e)))).collect();
                        }
                    }
                    chunk_id_list.into_iter().enumerate().map(|(i, id)| (chunk_start + i, Ok(id))).collect()
                }
                Err(e) if mode == BatchMode::ContinueOnError => {
                    let mut out = vec![];
                    let mut entries = vec![];
                    for (i, id) in chunk_id_list.into_iter().enumerate() {
                        match whole_write(&session, &retry, &model, &[id], &changes).await {
                            Ok(()) => {
                                if let Some(b) = before.get(&id) {
                                    entries.push(JournalEntry::Update { model: model.clone(), id, before: b.clone() });
                                }
                                out.push((chunk_start + i, Ok(id)));
                            }
                            Err(err) => out.push((chunk_start + i, Err(err))),
                        }
                    }
                    if let Some(scope) = &scope {
                        let _ = scope.journal_group(entries);
                    }
                    let _ = e;
                    out
                }
                Err(e) => fan_out_error(chunk_start, chunk_id_list.len(), e),
            }
        }
    })
    .await
}

/// `bulk_delete`: one `unlink` RPC per chunk (spec §4.4). When `scope` is
/// set, the pre-delete records are read first so each chunk journals as one
/// grouped entry of `Delete`/`Irreversible` members.
pub async fn bulk_delete(
    session: Arc<Session>,
    retry: Option<Arc<RetryManager>>,
    model: impl Into<String>,
    ids: Vec<i64>,
    config: &BatchConfig,
    mode: BatchMode,
    scope: Option<TransactionScope>,
    progress: Option<Arc<dyn ProgressSink>>,
) -> BatchOutcome<i64> {
    let model = model.into();
    let id_values: Vec<Json> = ids.iter().map(|i| Json::from(*i)).collect();
    let chunks = chunk_vec(&id_values, config.max_chunk_size);
    run_indexed_chunks(chunks, config, mode, OpKind::Delete, progress, move |chunk_start, chunk| {
        let session = session.clone();
        let retry = retry.clone();
        let model = model.clone();
        let scope = scope.clone();
        async move {
            let chunk_id_list = chunk_ids(&chunk);
            let before = if scope.is_some() {
                match read_by_id(&session, &model, &chunk_id_list, &[]).await {
                    Ok(map) => map,
                    Err(e) => return fan_out_error(chunk_start, chunk.len(), e),
                }
            } else {
                HashMap::new()
            };
            match whole_unlink(&session, &retry, &model, &chunk_id_list).await {
                Ok(()) => {
                    if let Some(scope) = &scope {
                        let entries = chunk_id_list
                            .iter()
                            .filter_map(|id| before.get(id).map(|record| scope.classify_delete_entry(&model, *id, record.clone())))
                            .collect();
                        if let Err(e) = scope.journal_group(entries) {
                            return (0..chunk_id_list.len()).map(|i| (chunk_start + i, Err(group_journal_error(&e)))).collect();
                        }
                    }
                    chunk_id_list.into_iter().enumerate().map(|(i, id)| (chunk_start + i, Ok(id))).collect()
                }
                Err(e) if mode == BatchMode::ContinueOnError => {
                    let mut out = vec![];
                    let mut entries = vec![];
                    for (i, id) in chunk_id_list.into_iter().enumerate() {
                        match whole_unlink(&session, &retry, &model, &[id]).await {
                            Ok(()) => {
                                if let Some(scope) = &scope {
                                    if let Some(record) = before.get(&id) {
                                        entries.push(scope.classify_delete_entry(&model, id, record.clone()));
                                    }
                                }
                                out.push((chunk_start + i, Ok(id)));
                            }
                            Err(err) => out.push((chunk_start + i, Err(err))),
                        }
                    }
                    if let Some(scope) = &scope {
                        let _ = scope.journal_group(entries);
                    }
                    let _ = e;
                    out
                }
                Err(e) => fan_out_error(chunk_start, chunk_id_list.len(), e),
            }
        }
    })
    .await
}

fn fan_out_error<T>(chunk_start: usize, len: usize, e: Error) -> Vec<(usize, Result<T, Error>)> {
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let message = if i == 0 {
            e.to_string()
        } else {
            format!("sibling record in the same chunk failed: {e}")
        };
        out.push((chunk_start + i, Err(Error::TransactionError { message })));
    }
    out
}

fn group_journal_error(e: &Error) -> Error {
    Error::TransactionError {
        message: format!("writes succeeded but could not be journaled into the active transaction scope: {e}"),
    }
}

/// Streaming variant (spec §4.4): pulls chunks lazily from `pages` so the
/// total record count need not be known up front. Does not participate in a
/// transaction scope — callers needing journaled streaming writes should
/// chunk up front and use [`bulk_create`] instead.
pub async fn bulk_create_streaming(
    session: Arc<Session>,
    retry: Option<Arc<RetryManager>>,
    model: impl Into<String>,
    pages: impl IntoIterator<Item = Vec<Json>>,
    mode: BatchMode,
    progress: Option<Arc<dyn ProgressSink>>,
) -> BatchOutcome<i64> {
    let model = model.into();
    let mut outcome = BatchOutcome::default();
    let mut processed = 0u64;
    for (index, chunk) in pages.into_iter().enumerate() {
        if mode == BatchMode::StopOnError && outcome.rollback_requested {
            break;
        }
        let chunk_len = chunk.len() as u64;
        let result = whole_create(&session, &retry, &model, chunk).await;
        processed += chunk_len;
        if let Some(sink) = &progress {
            sink.on_chunk(processed, 0, OpKind::Create);
        }
        match result {
            Ok(ids) => outcome.successful.extend(ids),
            Err(e) => {
                outcome.failed.push((index, e));
                if mode == BatchMode::StopOnError {
                    outcome.rollback_requested = true;
                }
            }
        }
    }
    outcome
}
