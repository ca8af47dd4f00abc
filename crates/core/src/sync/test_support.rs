//! In-memory implementations of the sync ports for engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::*;
use crate::entities::{format_timestamp, EntityKey, EntityKind, InternalRow, MappedChange};
use crate::errors::{DatabaseError, Error, Result};
use crate::settings::SyncSettings;

#[derive(Default)]
struct MemoryState {
    rows: HashMap<EntityKey, InternalRow>,
    revisions: HashMap<EntityKey, IdempotencyRecord>,
    next_row_id: i64,
    logs: Vec<SyncLogEntry>,
    watermarks: HashMap<(String, EntityKind), DateTime<Utc>>,
    checkpoints: HashMap<(String, EntityKind), PullCheckpoint>,
    retries: HashMap<String, RetryUnit>,
    dead_letters: Vec<DeadLetter>,
    apply_failures: VecDeque<DatabaseError>,
    apply_delay: Option<Duration>,
    read_delay: Option<Duration>,
}

/// One in-memory backend standing in for every storage port.
#[derive(Default, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` applies fail with `error` before touching state.
    pub fn fail_applies(&self, count: usize, error: DatabaseError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.apply_failures.push_back(error.clone());
        }
    }

    pub fn delay_applies(&self, delay: Duration) {
        self.state.lock().unwrap().apply_delay = Some(delay);
    }

    /// Revision reads block the calling thread for `delay`.
    pub fn delay_revision_reads(&self, delay: Duration) {
        self.state.lock().unwrap().read_delay = Some(delay);
    }

    pub fn row(&self, store_id: &str, kind: EntityKind, external_id: &str) -> Option<InternalRow> {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(&EntityKey::new(store_id, kind, external_id))
            .cloned()
    }

    pub fn row_count(&self, kind: EntityKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .rows
            .keys()
            .filter(|key| key.kind == kind)
            .count()
    }

    pub fn logs(&self) -> Vec<SyncLogEntry> {
        self.state.lock().unwrap().logs.clone()
    }

    pub fn retries(&self) -> Vec<RetryUnit> {
        self.state.lock().unwrap().retries.values().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().unwrap().dead_letters.clone()
    }

    /// Makes every queued retry due now.
    pub fn expire_retry_delays(&self) {
        let mut state = self.state.lock().unwrap();
        for retry in state.retries.values_mut() {
            retry.next_retry_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    fn update_log<F>(&self, log_id: &str, update: F) -> Result<SyncLogEntry>
    where
        F: FnOnce(&mut SyncLogEntry) -> Result<()>,
    {
        let mut state = self.state.lock().unwrap();
        let log = state
            .logs
            .iter_mut()
            .find(|log| log.id == log_id)
            .ok_or_else(|| Error::Database(DatabaseError::NotFound(log_id.to_string())))?;
        update(log)?;
        Ok(log.clone())
    }
}

#[async_trait]
impl MirrorRepositoryTrait for MemoryBackend {
    fn get_revision(&self, key: &EntityKey) -> Result<Option<IdempotencyRecord>> {
        let delay = self.state.lock().unwrap().read_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(self.state.lock().unwrap().revisions.get(key).cloned())
    }

    async fn apply_change(&self, change: MappedChange, revision: Revision) -> Result<ApplyResult> {
        let delay = self.state.lock().unwrap().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.apply_failures.pop_front() {
            return Err(Error::Database(err));
        }
        let key = change.key();
        let decision = should_apply(state.revisions.get(&key).map(|r| &r.revision), &revision);
        if !decision.should_write() {
            return Ok(ApplyResult::Stale);
        }
        let now = format_timestamp(Utc::now());

        match change {
            MappedChange::Upsert(row) => {
                let mut columns: BTreeMap<String, Value> = row.columns.clone();
                for parent in &row.parents {
                    let parent_key =
                        EntityKey::new(row.store_id.clone(), parent.kind, parent.external_id.clone());
                    let parent_id = state.rows.get(&parent_key).map(|r| r.id).ok_or_else(|| {
                        Error::Database(DatabaseError::Referential {
                            parent_kind: parent.kind,
                            parent_external_id: parent.external_id.clone(),
                            message: format!("{} not mirrored", parent_key),
                        })
                    })?;
                    columns.insert(parent.column.to_string(), Value::from(parent_id));
                }
                let existing_id = state.rows.get(&key).map(|r| r.id);
                let id = match existing_id {
                    Some(id) => id,
                    None => {
                        state.next_row_id += 1;
                        state.next_row_id
                    }
                };
                state.rows.insert(
                    key.clone(),
                    InternalRow {
                        id,
                        kind: key.kind,
                        store_id: key.store_id.clone(),
                        external_id: key.external_id.clone(),
                        last_sync: now.clone(),
                        deleted_at: None,
                        columns,
                    },
                );
            }
            MappedChange::Delete { .. } => {
                if let Some(existing) = state.rows.get_mut(&key) {
                    existing.deleted_at = Some(now.clone());
                    existing.last_sync = now.clone();
                }
            }
        }
        state.revisions.insert(
            key.clone(),
            IdempotencyRecord {
                store_id: key.store_id.clone(),
                kind: key.kind,
                external_id: key.external_id.clone(),
                revision,
                updated_at: now,
            },
        );
        Ok(ApplyResult::Applied(decision))
    }

    fn get_row(&self, key: &EntityKey) -> Result<Option<InternalRow>> {
        Ok(self.state.lock().unwrap().rows.get(key).cloned())
    }
}

#[async_trait]
impl SyncLogRepositoryTrait for MemoryBackend {
    async fn begin(&self, new_log: NewSyncLog) -> Result<SyncLogEntry> {
        let entry = SyncLogEntry {
            id: Uuid::new_v4().to_string(),
            store_id: new_log.store_id,
            sync_type: new_log.sync_type,
            entity_kind: new_log.entity_kind,
            status: SyncStatus::Pending,
            started_at: format_timestamp(Utc::now()),
            completed_at: None,
            records_processed: 0,
            records_success: 0,
            records_failed: 0,
            error_message: None,
            error_details: None,
            window_start: None,
        };
        self.state.lock().unwrap().logs.push(entry.clone());
        Ok(entry)
    }

    async fn record_progress(&self, log_id: &str, delta: SyncProgress) -> Result<SyncLogEntry> {
        delta.validate()?;
        self.update_log(log_id, |log| {
            if log.status.is_terminal() {
                return Err(Error::InvalidInput("log already closed".to_string()));
            }
            log.status = SyncStatus::Syncing;
            log.records_processed += delta.processed;
            log.records_success += delta.success;
            log.records_failed += delta.failed;
            Ok(())
        })
    }

    async fn complete(
        &self,
        log_id: &str,
        status: SyncStatus,
        error: Option<SyncLogError>,
    ) -> Result<SyncLogEntry> {
        self.update_log(log_id, |log| {
            log.status = status;
            log.completed_at = Some(format_timestamp(Utc::now()));
            if let Some(error) = error {
                log.error_message = Some(error.message);
                log.error_details = error.details;
            }
            Ok(())
        })
    }

    async fn complete_pull(&self, log_id: &str, completion: PullCompletion) -> Result<SyncLogEntry> {
        let entry = self
            .complete(log_id, completion.status, completion.error.clone())
            .await?;
        let mut state = self.state.lock().unwrap();
        let key = (completion.store_id.clone(), completion.kind);
        if completion.status == SyncStatus::Completed {
            state.watermarks.insert(key.clone(), completion.watermark);
        }
        state.checkpoints.remove(&key);
        Ok(entry)
    }

    async fn record_window_outcome(
        &self,
        window: SyncWindow,
        delta: SyncProgress,
        last_error: Option<String>,
    ) -> Result<()> {
        let window_start = format_timestamp(window.window_start);
        let mut state = self.state.lock().unwrap();
        let existing = state.logs.iter().position(|log| {
            log.store_id == window.store_id
                && log.sync_type == window.sync_type
                && log.window_start.as_deref() == Some(window_start.as_str())
        });
        let idx = match existing {
            Some(idx) => idx,
            None => {
                state.logs.push(SyncLogEntry {
                    id: Uuid::new_v4().to_string(),
                    store_id: window.store_id.clone(),
                    sync_type: window.sync_type,
                    entity_kind: None,
                    status: SyncStatus::Syncing,
                    started_at: window_start.clone(),
                    completed_at: None,
                    records_processed: 0,
                    records_success: 0,
                    records_failed: 0,
                    error_message: None,
                    error_details: None,
                    window_start: Some(window_start),
                });
                state.logs.len() - 1
            }
        };
        let log = &mut state.logs[idx];
        log.records_processed += delta.processed;
        log.records_success += delta.success;
        log.records_failed += delta.failed;
        if last_error.is_some() {
            log.error_message = last_error;
        }
        Ok(())
    }

    async fn close_windows_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_timestamp(cutoff);
        let mut state = self.state.lock().unwrap();
        let mut closed = 0;
        for log in state.logs.iter_mut() {
            let open_window = log.window_start.as_deref().is_some_and(|start| start < cutoff.as_str());
            if open_window && !log.status.is_terminal() {
                log.status = SyncStatus::Completed;
                log.completed_at = Some(format_timestamp(Utc::now()));
                closed += 1;
            }
        }
        Ok(closed)
    }

    fn get_log(&self, log_id: &str) -> Result<Option<SyncLogEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .iter()
            .find(|log| log.id == log_id)
            .cloned())
    }

    fn list_logs(&self, store_id: &str, limit: i64) -> Result<Vec<SyncLogEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .iter()
            .rev()
            .filter(|log| log.store_id == store_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    fn get_watermark(&self, store_id: &str, kind: EntityKind) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .watermarks
            .get(&(store_id.to_string(), kind))
            .copied())
    }
}

#[async_trait]
impl PullCheckpointRepositoryTrait for MemoryBackend {
    fn get_checkpoint(&self, store_id: &str, kind: EntityKind) -> Result<Option<PullCheckpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(&(store_id.to_string(), kind))
            .cloned())
    }

    async fn save_checkpoint(&self, checkpoint: PullCheckpoint) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .insert((checkpoint.store_id.clone(), checkpoint.kind), checkpoint);
        Ok(())
    }

    async fn clear_checkpoint(&self, store_id: &str, kind: EntityKind) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .remove(&(store_id.to_string(), kind));
        Ok(())
    }
}

#[async_trait]
impl RetryQueueRepositoryTrait for MemoryBackend {
    async fn upsert_retry(&self, unit: RetryUnit) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .retries
            .insert(unit.id.clone(), unit);
        Ok(())
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_secs: i64,
    ) -> Result<Vec<RetryUnit>> {
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<&mut RetryUnit> = state
            .retries
            .values_mut()
            .filter(|retry| retry.next_retry_at <= now)
            .collect();
        due.sort_by_key(|retry| retry.next_retry_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|retry| {
                let claimed = retry.clone();
                retry.next_retry_at = now + chrono::Duration::seconds(lease_secs);
                claimed
            })
            .collect())
    }

    async fn remove_retry(&self, retry_id: &str) -> Result<()> {
        self.state.lock().unwrap().retries.remove(retry_id);
        Ok(())
    }

    async fn move_to_dead_letter(&self, retry_id: Option<String>, letter: DeadLetter) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(retry_id) = retry_id {
            state.retries.remove(&retry_id);
        }
        state.dead_letters.push(letter);
        Ok(())
    }

    fn list_dead_letters(&self, store_id: &str, limit: i64) -> Result<Vec<DeadLetter>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dead_letters
            .iter()
            .filter(|letter| letter.store_id == store_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dead_letters
            .iter()
            .find(|letter| letter.id == id)
            .cloned())
    }

    async fn resubmit_dead_letter(&self, id: &str, unit: RetryUnit) -> Result<DeadLetter> {
        let mut state = self.state.lock().unwrap();
        let letter = state
            .dead_letters
            .iter_mut()
            .find(|letter| letter.id == id)
            .ok_or_else(|| Error::Database(DatabaseError::NotFound(id.to_string())))?;
        letter.resubmitted_at = Some(format_timestamp(Utc::now()));
        let updated = letter.clone();
        state.retries.insert(unit.id.clone(), unit);
        Ok(updated)
    }
}

/// Scripted listing endpoint: fixed records per kind, optional injected errors.
#[derive(Default, Clone)]
pub struct ScriptedListing {
    records: Arc<Mutex<HashMap<EntityKind, Vec<Value>>>>,
    errors: Arc<Mutex<VecDeque<(u32, Error)>>>,
    fetched: Arc<Mutex<Vec<(EntityKind, u32, Option<DateTime<Utc>>)>>>,
    cancel_on: Arc<Mutex<Option<(u32, CancelFlag)>>>,
}

impl ScriptedListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_records(&self, kind: EntityKind, records: Vec<Value>) {
        self.records.lock().unwrap().insert(kind, records);
    }

    /// The next fetch of `page` fails with `error`.
    pub fn fail_page(&self, page: u32, error: Error) {
        self.errors.lock().unwrap().push_back((page, error));
    }

    /// Trips `flag` once `page` has been served.
    pub fn cancel_after_page(&self, page: u32, flag: CancelFlag) {
        *self.cancel_on.lock().unwrap() = Some((page, flag));
    }

    pub fn fetched_pages(&self) -> Vec<u32> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, page, _)| *page)
            .collect()
    }

    pub fn requested_since(&self) -> Vec<Option<DateTime<Utc>>> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, since)| *since)
            .collect()
    }
}

#[async_trait]
impl StoreListingSourceTrait for ScriptedListing {
    async fn fetch_page(&self, request: ListingRequest) -> Result<ListingPage> {
        {
            let mut errors = self.errors.lock().unwrap();
            if let Some(pos) = errors.iter().position(|(page, _)| *page == request.page) {
                if let Some((_, err)) = errors.remove(pos) {
                    return Err(err);
                }
            }
        }
        self.fetched
            .lock()
            .unwrap()
            .push((request.kind, request.page, request.since));
        if let Some((page, flag)) = self.cancel_on.lock().unwrap().as_ref() {
            if *page == request.page {
                flag.cancel();
            }
        }

        let records = self
            .records
            .lock()
            .unwrap()
            .get(&request.kind)
            .cloned()
            .unwrap_or_default();
        let per_page = request.per_page.max(1) as usize;
        let total_pages = records.len().div_ceil(per_page).max(1) as u32;
        let start = (request.page.saturating_sub(1) as usize) * per_page;
        let page_records = records.iter().skip(start).take(per_page).cloned().collect();
        Ok(ListingPage {
            records: page_records,
            current_page: request.page,
            total_pages,
            per_page: request.per_page,
            total: records.len() as u64,
        })
    }
}

/// Engine wired against the in-memory backend.
pub struct Harness {
    pub backend: MemoryBackend,
    pub listing: ScriptedListing,
    pub dispatcher: SyncDispatcher,
    pub retries: Arc<RetryManager>,
    pub scheduler: PullScheduler,
    pub settings: SyncSettings,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SyncSettings {
            batch_size: 2,
            reconciler_shards: 4,
            ..SyncSettings::default()
        })
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let backend = MemoryBackend::new();
        let listing = ScriptedListing::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(backend.clone()),
            settings.storage_timeout(),
        ));
        let retries = Arc::new(RetryManager::new(
            Arc::new(backend.clone()),
            RetryPolicy::from_settings(&settings),
        ));
        let dispatcher = SyncDispatcher::spawn(
            DispatcherContext {
                reconciler,
                retries: retries.clone(),
                sync_log: Arc::new(backend.clone()),
                window_secs: settings.webhook_window_secs,
            },
            settings.reconciler_shards,
            settings.shard_queue_depth,
        );
        let scheduler = PullScheduler::new(
            Arc::new(listing.clone()),
            dispatcher.clone(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(RateLimiter::new(
                settings.requests_per_minute,
                settings.rate_limit_pause_ceiling(),
            )),
            PullOptions::from_settings(&settings),
        );
        Self {
            backend,
            listing,
            dispatcher,
            retries,
            scheduler,
            settings,
        }
    }

    /// Submits one unit and waits for its outcome.
    pub async fn apply(&self, event: ChangeEvent, origin: WorkOrigin) -> ReconcileOutcome {
        self.dispatcher
            .submit(WorkUnit::new(event, origin))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap()
    }
}
