//! Re-drives failed units with backoff and parks the ones that cannot succeed.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    DeadLetter, FailureKind, ReconcileOutcome, RetryPolicy, RetryQueueRepositoryTrait, RetryUnit,
    SyncDispatcher, SyncFailure, WorkOrigin, WorkUnit,
};
use crate::entities::format_timestamp;
use crate::errors::{DatabaseError, Error, Result};

/// Claimed retries stay invisible to other pumps for this long.
const RETRY_LEASE_SECS: i64 = 300;

/// What happened to a unit after its attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Applied or skipped; any pending retry entry is gone.
    Settled,
    Scheduled {
        attempts: u32,
        delay_ms: u64,
    },
    DeadLettered {
        reason: FailureKind,
        attempts: u32,
    },
}

pub struct RetryManager {
    queue: Arc<dyn RetryQueueRepositoryTrait>,
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(queue: Arc<dyn RetryQueueRepositoryTrait>, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn handle_outcome(
        &self,
        unit: &WorkUnit,
        outcome: &ReconcileOutcome,
    ) -> Result<RetryDisposition> {
        match outcome {
            ReconcileOutcome::Applied { .. } | ReconcileOutcome::Skipped { .. } => {
                if let Some(retry_id) = unit.retry_id.as_deref() {
                    self.queue.remove_retry(retry_id).await?;
                }
                Ok(RetryDisposition::Settled)
            }
            ReconcileOutcome::Failed(failure) => self.schedule(unit, failure).await,
        }
    }

    /// Schedules the next attempt, or dead-letters the unit when the failure is
    /// permanent or the attempt bound is reached.
    pub async fn schedule(&self, unit: &WorkUnit, failure: &SyncFailure) -> Result<RetryDisposition> {
        let attempts = unit.attempt.saturating_add(1);
        let key = unit.event.key();

        if !failure.retryable {
            warn!(
                "[RetryManager] {} failed permanently ({:?}): {}",
                key, failure.kind, failure.message
            );
            return self
                .dead_letter(unit, failure.kind, failure.message.clone(), attempts)
                .await;
        }

        if !self.policy.allows_retry(attempts) {
            error!(
                "[RetryManager] {} exhausted {} attempts, moving to dead letters: {}",
                key, attempts, failure.message
            );
            return self
                .dead_letter(
                    unit,
                    FailureKind::ExhaustedRetry,
                    format!("{:?}: {}", failure.kind, failure.message),
                    attempts,
                )
                .await;
        }

        let delay = self.policy.delay_for(attempts, failure.kind);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let retry = RetryUnit {
            id: unit
                .retry_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            store_id: unit.event.store_id.clone(),
            kind: unit.event.kind,
            external_id: unit.event.external_id.clone(),
            event: unit.event.clone(),
            attempts,
            next_retry_at,
            failure_kind: failure.kind,
            last_error: failure.message.clone(),
            created_at: format_timestamp(Utc::now()),
        };
        self.queue.upsert_retry(retry).await?;
        debug!(
            "[RetryManager] {} attempt {} failed ({:?}), retrying in {:?}",
            key, attempts, failure.kind, delay
        );
        Ok(RetryDisposition::Scheduled {
            attempts,
            delay_ms: delay.as_millis() as u64,
        })
    }

    async fn dead_letter(
        &self,
        unit: &WorkUnit,
        reason: FailureKind,
        last_error: String,
        attempts: u32,
    ) -> Result<RetryDisposition> {
        let letter = DeadLetter {
            id: Uuid::new_v4().to_string(),
            store_id: unit.event.store_id.clone(),
            kind: unit.event.kind,
            external_id: unit.event.external_id.clone(),
            reason,
            last_error,
            attempts,
            event: unit.event.clone(),
            created_at: format_timestamp(Utc::now()),
            resubmitted_at: None,
        };
        self.queue
            .move_to_dead_letter(unit.retry_id.clone(), letter)
            .await?;
        Ok(RetryDisposition::DeadLettered { reason, attempts })
    }

    /// Claims due retries as work units for the dispatcher.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<WorkUnit>> {
        let due = self
            .queue
            .claim_due_retries(Utc::now(), limit, RETRY_LEASE_SECS)
            .await?;
        Ok(due
            .into_iter()
            .map(|retry| WorkUnit {
                event: retry.event,
                origin: WorkOrigin::Retry,
                attempt: retry.attempts,
                retry_id: Some(retry.id),
            })
            .collect())
    }

    /// Feeds due retries into the dispatcher. Returns how many were queued.
    pub async fn pump(&self, dispatcher: &SyncDispatcher, limit: i64) -> Result<usize> {
        let due = self.claim_due(limit).await?;
        let mut queued = 0;
        for unit in due {
            // Leased units that fail to queue reappear once the lease lapses.
            match dispatcher.submit(unit).await {
                Ok(_) => queued += 1,
                Err(err) => {
                    warn!("[RetryManager] Could not queue retry: {}", err);
                    break;
                }
            }
        }
        if queued > 0 {
            debug!("[RetryManager] Queued {} due retries", queued);
        }
        Ok(queued)
    }

    pub fn list_dead_letters(&self, store_id: &str, limit: i64) -> Result<Vec<DeadLetter>> {
        self.queue.list_dead_letters(store_id, limit)
    }

    pub fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        self.queue.get_dead_letter(id)
    }

    /// Moves a dead letter back into the retry queue with a fresh attempt count.
    pub async fn resubmit(&self, id: &str) -> Result<DeadLetter> {
        let letter = self.queue.get_dead_letter(id)?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!("dead letter '{}'", id)))
        })?;
        if letter.resubmitted_at.is_some() {
            return Err(Error::InvalidInput(format!(
                "dead letter '{}' was already resubmitted",
                id
            )));
        }
        let unit = RetryUnit {
            id: Uuid::new_v4().to_string(),
            store_id: letter.store_id.clone(),
            kind: letter.kind,
            external_id: letter.external_id.clone(),
            event: letter.event.clone(),
            attempts: 0,
            next_retry_at: Utc::now(),
            failure_kind: letter.reason,
            last_error: letter.last_error.clone(),
            created_at: format_timestamp(Utc::now()),
        };
        let updated = self.queue.resubmit_dead_letter(id, unit).await?;
        info!(
            "[RetryManager] Resubmitted dead letter {} for {}/{}/{}",
            id, updated.store_id, updated.kind, updated.external_id
        );
        Ok(updated)
    }
}
