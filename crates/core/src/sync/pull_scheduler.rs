//! Paginated full and incremental pulls from the platform listing API.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    backoff_with_jitter, ChangeEvent, ChangeOp, EventSource, ListingPage, ListingRequest,
    NewSyncLog, PullCheckpoint, PullCheckpointRepositoryTrait, PullCompletion, RateLimiter,
    ReconcileOutcome, StoreListingSourceTrait, SyncDispatcher, SyncLogEntry, SyncLogError,
    SyncLogRepositoryTrait, SyncProgress, SyncStatus, SyncType, WorkOrigin, WorkUnit,
};
use crate::entities::{format_timestamp, EntityKind};
use crate::errors::{Error, Result};
use crate::settings::SyncSettings;

/// Per-record failures kept in a pull log's error details.
const MAX_FAILURE_DETAILS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    Full,
    Incremental,
}

impl PullMode {
    fn sync_type(&self) -> SyncType {
        match self {
            Self::Full => SyncType::Full,
            Self::Incremental => SyncType::Incremental,
        }
    }
}

/// Cooperative cancellation for a running pull.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSummary {
    pub log_id: String,
    pub store_id: String,
    pub kind: EntityKind,
    pub mode: PullMode,
    pub status: SyncStatus,
    pub cancelled: bool,
    pub resumed_from_page: Option<u32>,
    pub pages: u32,
    pub progress: SyncProgress,
}

/// Pull tuning drawn from the settings.
#[derive(Debug, Clone)]
pub struct PullOptions {
    pub per_page: u32,
    pub page_fetch_max_attempts: u32,
    pub page_retry_base_delay: Duration,
    pub page_retry_max_delay: Duration,
    pub api_timeout: Duration,
}

impl PullOptions {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            per_page: settings.batch_size.max(1),
            page_fetch_max_attempts: settings.page_fetch_max_attempts.max(1),
            page_retry_base_delay: Duration::from_secs(1),
            page_retry_max_delay: Duration::from_secs(settings.retry_max_delay_secs.max(1)),
            api_timeout: settings.api_timeout(),
        }
    }
}

/// One fetched page, already turned into change events.
#[derive(Debug, Clone)]
pub struct PulledPage {
    pub page: u32,
    pub total_pages: u32,
    pub events: Vec<ChangeEvent>,
}

/// Lazy page-by-page crawl of one listing endpoint.
///
/// Each page fetch waits on the store's rate limiter and is retried on its own;
/// a failing page never restarts the crawl.
pub struct PullCrawl {
    source: Arc<dyn StoreListingSourceTrait>,
    limiter: Arc<RateLimiter>,
    options: PullOptions,
    store_id: String,
    kind: EntityKind,
    since: Option<DateTime<Utc>>,
    next_page: u32,
    finished: bool,
}

impl PullCrawl {
    pub fn new(
        source: Arc<dyn StoreListingSourceTrait>,
        limiter: Arc<RateLimiter>,
        options: PullOptions,
        store_id: impl Into<String>,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        start_page: u32,
    ) -> Self {
        Self {
            source,
            limiter,
            options,
            store_id: store_id.into(),
            kind,
            since,
            next_page: start_page.max(1),
            finished: false,
        }
    }

    pub fn next_page_number(&self) -> u32 {
        self.next_page
    }

    /// Fetches the next page, or `None` once the listing reports no more pages.
    pub async fn next_page(&mut self) -> Result<Option<PulledPage>> {
        if self.finished {
            return Ok(None);
        }
        let page_number = self.next_page;
        let listing = self.fetch_with_retry(page_number).await?;
        let observed_at = Utc::now();
        let has_more = listing.has_more();
        let ListingPage {
            records,
            current_page,
            total_pages,
            ..
        } = listing;

        let mut events = Vec::with_capacity(records.len());
        for (offset, record) in records.into_iter().enumerate() {
            let external_id = match record_id(&record) {
                Some(id) => id,
                None => {
                    warn!(
                        "[PullScheduler] {} page {} record {} has no id, skipping",
                        self.kind, page_number, offset
                    );
                    continue;
                }
            };
            let position = (u64::from(page_number.saturating_sub(1)) * u64::from(self.options.per_page))
                + offset as u64;
            events.push(ChangeEvent {
                source: EventSource::Pull,
                kind: self.kind,
                op: ChangeOp::Upsert,
                store_id: self.store_id.clone(),
                external_id,
                payload: record,
                observed_at,
                sequence_hint: i64::try_from(position).ok(),
            });
        }

        if has_more && current_page >= page_number {
            self.next_page = current_page + 1;
        } else {
            self.finished = true;
            self.next_page = page_number + 1;
        }

        Ok(Some(PulledPage {
            page: page_number,
            total_pages,
            events,
        }))
    }

    async fn fetch_with_retry(&self, page: u32) -> Result<ListingPage> {
        let mut failures = 0_u32;
        loop {
            self.limiter.acquire(&self.store_id).await;
            let request = ListingRequest {
                store_id: self.store_id.clone(),
                kind: self.kind,
                page,
                per_page: self.options.per_page,
                since: self.since,
            };
            let fetched = tokio::time::timeout(self.options.api_timeout, self.source.fetch_page(request))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!(
                        "listing {} page {} exceeded {:?}",
                        self.kind, page, self.options.api_timeout
                    )))
                });

            match fetched {
                Ok(listing) => return Ok(listing),
                // Quota exhaustion pauses the crawl; it is not a failed attempt.
                Err(Error::RateLimited { retry_after_secs }) => {
                    self.limiter
                        .pause(&self.store_id, Duration::from_secs(retry_after_secs.max(1)))
                        .await;
                }
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    if failures >= self.options.page_fetch_max_attempts {
                        return Err(Error::ExhaustedRetry {
                            attempts: failures,
                            message: format!("{} page {}: {}", self.kind, page, err),
                        });
                    }
                    let delay = backoff_with_jitter(
                        self.options.page_retry_base_delay,
                        failures - 1,
                        self.options.page_retry_max_delay,
                    );
                    debug!(
                        "[PullScheduler] {} page {} attempt {} failed: {}; retrying in {:?}",
                        self.kind, page, failures, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) if id.is_i64() || id.is_u64() => Some(id.to_string()),
        _ => None,
    }
}

/// Drives pulls for a store and kind, checkpointing after every page.
pub struct PullScheduler {
    source: Arc<dyn StoreListingSourceTrait>,
    dispatcher: SyncDispatcher,
    sync_log: Arc<dyn SyncLogRepositoryTrait>,
    checkpoints: Arc<dyn PullCheckpointRepositoryTrait>,
    limiter: Arc<RateLimiter>,
    options: PullOptions,
}

impl PullScheduler {
    pub fn new(
        source: Arc<dyn StoreListingSourceTrait>,
        dispatcher: SyncDispatcher,
        sync_log: Arc<dyn SyncLogRepositoryTrait>,
        checkpoints: Arc<dyn PullCheckpointRepositoryTrait>,
        limiter: Arc<RateLimiter>,
        options: PullOptions,
    ) -> Self {
        Self {
            source,
            dispatcher,
            sync_log,
            checkpoints,
            limiter,
            options,
        }
    }

    /// Lazy crawl starting at `start_page`; `since` filters to records updated after it.
    pub fn crawl(
        &self,
        store_id: &str,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        start_page: u32,
    ) -> PullCrawl {
        PullCrawl::new(
            self.source.clone(),
            self.limiter.clone(),
            self.options.clone(),
            store_id,
            kind,
            since,
            start_page,
        )
    }

    /// Runs one pull to completion, cancellation or failure.
    ///
    /// A checkpoint left by an interrupted pull of the same mode is resumed from
    /// its next page. Only a completed pull advances the watermark.
    pub async fn run_pull(
        &self,
        store_id: &str,
        kind: EntityKind,
        mode: PullMode,
        cancel: &CancelFlag,
    ) -> Result<PullSummary> {
        if !kind.is_listable() {
            return Err(Error::InvalidInput(format!("{} has no listing endpoint", kind)));
        }
        let sync_type = mode.sync_type();

        let resumable = match self.checkpoints.get_checkpoint(store_id, kind)? {
            Some(checkpoint) if checkpoint.sync_type == sync_type => Some(checkpoint),
            Some(checkpoint) => {
                info!(
                    "[PullScheduler] Discarding {:?} checkpoint for {}/{} in favour of a {:?} pull",
                    checkpoint.sync_type, store_id, kind, sync_type
                );
                self.checkpoints.clear_checkpoint(store_id, kind).await?;
                None
            }
            None => None,
        };

        let (log, mut checkpoint, resumed_from_page) = match resumable {
            Some(checkpoint) => {
                let log = self.resume_log(&checkpoint, store_id, kind, sync_type).await?;
                let resumed_from = checkpoint.next_page;
                info!(
                    "[PullScheduler] Resuming {:?} pull of {}/{} at page {}",
                    sync_type, store_id, kind, resumed_from
                );
                let checkpoint = PullCheckpoint {
                    log_id: log.id.clone(),
                    ..checkpoint
                };
                (log, checkpoint, Some(resumed_from))
            }
            None => {
                let since = match mode {
                    PullMode::Full => None,
                    PullMode::Incremental => self.sync_log.get_watermark(store_id, kind)?,
                };
                let log = self
                    .sync_log
                    .begin(NewSyncLog {
                        store_id: store_id.to_string(),
                        sync_type,
                        entity_kind: Some(kind),
                    })
                    .await?;
                let checkpoint = PullCheckpoint {
                    store_id: store_id.to_string(),
                    kind,
                    sync_type,
                    next_page: 1,
                    log_id: log.id.clone(),
                    since,
                    crawl_started_at: Utc::now(),
                    updated_at: format_timestamp(Utc::now()),
                };
                info!(
                    "[PullScheduler] Starting {:?} pull of {}/{} (since {:?})",
                    sync_type, store_id, kind, since
                );
                (log, checkpoint, None)
            }
        };
        self.checkpoints.save_checkpoint(checkpoint.clone()).await?;

        let mut summary = PullSummary {
            log_id: log.id.clone(),
            store_id: store_id.to_string(),
            kind,
            mode,
            status: SyncStatus::Syncing,
            cancelled: false,
            resumed_from_page,
            pages: 0,
            progress: SyncProgress::default(),
        };
        let mut failures: Vec<Value> = Vec::new();
        let mut crawl = self.crawl(store_id, kind, checkpoint.since, checkpoint.next_page);

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(summary).await;
            }

            let page = match crawl.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        "[PullScheduler] {:?} pull of {}/{} stopped at page {}: {}",
                        sync_type,
                        store_id,
                        kind,
                        crawl.next_page_number(),
                        err
                    );
                    self.sync_log
                        .complete(
                            &summary.log_id,
                            SyncStatus::Failed,
                            Some(SyncLogError::new(err.to_string()).with_details(json!({
                                "page": crawl.next_page_number(),
                                "failures": failures,
                            }))),
                        )
                        .await?;
                    return Err(err);
                }
            };

            let delta = self.apply_page(&page, &mut failures).await?;
            self.sync_log.record_progress(&summary.log_id, delta).await?;
            summary.progress.add(delta);
            summary.pages += 1;

            checkpoint.next_page = page.page + 1;
            checkpoint.updated_at = format_timestamp(Utc::now());
            self.checkpoints.save_checkpoint(checkpoint.clone()).await?;
            debug!(
                "[PullScheduler] {}/{} page {}/{} done: {:?}",
                store_id, kind, page.page, page.total_pages, delta
            );
        }

        let error = (summary.progress.failed > 0).then(|| {
            SyncLogError::new(format!(
                "{} of {} records failed",
                summary.progress.failed, summary.progress.processed
            ))
            .with_details(Value::Array(failures.clone()))
        });
        self.sync_log
            .complete_pull(
                &summary.log_id,
                PullCompletion {
                    store_id: store_id.to_string(),
                    kind,
                    status: SyncStatus::Completed,
                    watermark: checkpoint.crawl_started_at,
                    error,
                },
            )
            .await?;
        summary.status = SyncStatus::Completed;
        info!(
            "[PullScheduler] Completed {:?} pull of {}/{}: {} pages, {:?}",
            sync_type, store_id, kind, summary.pages, summary.progress
        );
        Ok(summary)
    }

    /// Reuses the checkpoint's log while it is still open; a closed log
    /// (cancelled or failed run) gets a fresh entry for the resumed run.
    async fn resume_log(
        &self,
        checkpoint: &PullCheckpoint,
        store_id: &str,
        kind: EntityKind,
        sync_type: SyncType,
    ) -> Result<SyncLogEntry> {
        if let Some(log) = self.sync_log.get_log(&checkpoint.log_id)? {
            if !log.status.is_terminal() {
                return Ok(log);
            }
        }
        self.sync_log
            .begin(NewSyncLog {
                store_id: store_id.to_string(),
                sync_type,
                entity_kind: Some(kind),
            })
            .await
    }

    /// Submits a page and waits for every record's outcome.
    async fn apply_page(&self, page: &PulledPage, failures: &mut Vec<Value>) -> Result<SyncProgress> {
        let mut pending = Vec::with_capacity(page.events.len());
        for event in &page.events {
            let handle = self
                .dispatcher
                .submit(WorkUnit::new(event.clone(), WorkOrigin::Pull))
                .await
                .map_err(|err| Error::Cancelled(err.to_string()))?;
            pending.push((event.external_id.clone(), handle));
        }

        let mut delta = SyncProgress::default();
        for (external_id, handle) in pending {
            match handle.wait().await? {
                ReconcileOutcome::Applied { .. } => delta.add(SyncProgress::applied()),
                ReconcileOutcome::Skipped { .. } => delta.add(SyncProgress::skipped()),
                ReconcileOutcome::Failed(failure) => {
                    delta.add(SyncProgress::failed());
                    if failures.len() >= MAX_FAILURE_DETAILS {
                        continue;
                    }
                    failures.push(json!({
                        "externalId": external_id,
                        "kind": failure.kind,
                        "message": failure.message,
                        "retryable": failure.retryable,
                    }));
                }
            }
        }
        Ok(delta)
    }

    async fn finish_cancelled(&self, mut summary: PullSummary) -> Result<PullSummary> {
        info!(
            "[PullScheduler] Pull of {}/{} cancelled after {} pages; checkpoint kept",
            summary.store_id, summary.kind, summary.pages
        );
        self.sync_log
            .complete(
                &summary.log_id,
                SyncStatus::Failed,
                Some(SyncLogError::new("cancelled")),
            )
            .await?;
        summary.status = SyncStatus::Failed;
        summary.cancelled = true;
        Ok(summary)
    }
}
