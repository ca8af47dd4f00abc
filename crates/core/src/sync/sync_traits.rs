//! Storage and platform API ports implemented outside the core crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    ApplyDecision, DeadLetter, IdempotencyRecord, NewSyncLog, PullCheckpoint, PullCompletion,
    RetryUnit, Revision, SyncLogEntry, SyncLogError, SyncProgress, SyncStatus, SyncWindow,
};
use crate::entities::{EntityKey, EntityKind, InternalRow, MappedChange};
use crate::errors::Result;

/// Result of a transactional apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Applied(ApplyDecision),
    /// A newer revision was committed between the decision and the write.
    Stale,
}

/// Mirror tables plus the idempotency records guarding them.
#[async_trait]
pub trait MirrorRepositoryTrait: Send + Sync {
    fn get_revision(&self, key: &EntityKey) -> Result<Option<IdempotencyRecord>>;

    /// Writes the row and its idempotency record in one transaction.
    /// The revision check is repeated inside the transaction.
    async fn apply_change(&self, change: MappedChange, revision: Revision) -> Result<ApplyResult>;

    fn get_row(&self, key: &EntityKey) -> Result<Option<InternalRow>>;
}

/// Append-mostly sync history, watermarks included.
#[async_trait]
pub trait SyncLogRepositoryTrait: Send + Sync {
    async fn begin(&self, new_log: NewSyncLog) -> Result<SyncLogEntry>;

    async fn record_progress(&self, log_id: &str, delta: SyncProgress) -> Result<SyncLogEntry>;

    async fn complete(
        &self,
        log_id: &str,
        status: SyncStatus,
        error: Option<SyncLogError>,
    ) -> Result<SyncLogEntry>;

    /// Completes a pull batch, writes the watermark when it completed and
    /// clears the pull checkpoint, all in one transaction.
    async fn complete_pull(&self, log_id: &str, completion: PullCompletion) -> Result<SyncLogEntry>;

    /// Adds one outcome to the rolled-up row for `window`, creating it on first use.
    async fn record_window_outcome(
        &self,
        window: SyncWindow,
        delta: SyncProgress,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Marks open window rows that started before `cutoff` as completed.
    async fn close_windows_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn get_log(&self, log_id: &str) -> Result<Option<SyncLogEntry>>;

    fn list_logs(&self, store_id: &str, limit: i64) -> Result<Vec<SyncLogEntry>>;

    /// Start time of the last completed pull for (store, kind).
    fn get_watermark(&self, store_id: &str, kind: EntityKind) -> Result<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait PullCheckpointRepositoryTrait: Send + Sync {
    fn get_checkpoint(&self, store_id: &str, kind: EntityKind) -> Result<Option<PullCheckpoint>>;

    async fn save_checkpoint(&self, checkpoint: PullCheckpoint) -> Result<()>;

    async fn clear_checkpoint(&self, store_id: &str, kind: EntityKind) -> Result<()>;
}

/// Durable retry queue and dead-letter list.
#[async_trait]
pub trait RetryQueueRepositoryTrait: Send + Sync {
    /// Inserts or replaces the unit with the same id.
    async fn upsert_retry(&self, unit: RetryUnit) -> Result<()>;

    /// Returns up to `limit` due units and pushes their `next_retry_at` out by
    /// `lease_secs` so concurrent pumps do not claim them twice.
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_secs: i64,
    ) -> Result<Vec<RetryUnit>>;

    async fn remove_retry(&self, retry_id: &str) -> Result<()>;

    /// Parks a unit, removing its retry entry when `retry_id` is set.
    async fn move_to_dead_letter(&self, retry_id: Option<String>, letter: DeadLetter)
        -> Result<()>;

    fn list_dead_letters(&self, store_id: &str, limit: i64) -> Result<Vec<DeadLetter>>;

    fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>>;

    /// Marks the letter resubmitted and queues `unit` in the same transaction.
    async fn resubmit_dead_letter(&self, id: &str, unit: RetryUnit) -> Result<DeadLetter>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRequest {
    pub store_id: String,
    pub kind: EntityKind,
    pub page: u32,
    pub per_page: u32,
    pub since: Option<DateTime<Utc>>,
}

/// One page of a listing endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub records: Vec<Value>,
    pub current_page: u32,
    pub total_pages: u32,
    pub per_page: u32,
    pub total: u64,
}

impl ListingPage {
    pub fn has_more(&self) -> bool {
        self.current_page < self.total_pages
    }
}

/// Paginated listing endpoints of the platform API.
#[async_trait]
pub trait StoreListingSourceTrait: Send + Sync {
    async fn fetch_page(&self, request: ListingRequest) -> Result<ListingPage>;
}
