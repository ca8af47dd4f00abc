//! Per-entity state machine: map, decide, apply.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{
    should_apply, ApplyDecision, ApplyResult, ChangeEvent, MirrorRepositoryTrait, Revision,
    SyncFailure,
};
use crate::entities::map_change;
use crate::errors::{DatabaseError, Error};

/// Reconcile states for one (store, kind, external id, attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Received,
    Mapping,
    Deciding,
    Applying,
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        decision: ApplyDecision,
        revision: Revision,
    },
    /// Stale or duplicate revision; a no-op, not an error.
    Skipped { revision: Revision },
    Failed(SyncFailure),
}

impl ReconcileOutcome {
    pub fn state(&self) -> ReconcileState {
        match self {
            Self::Applied { .. } => ReconcileState::Applied,
            Self::Skipped { .. } => ReconcileState::Skipped,
            Self::Failed(_) => ReconcileState::Failed,
        }
    }

    pub fn failure(&self) -> Option<&SyncFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Applies change events against the mirror. Every error is classified here;
/// nothing escapes as an unhandled fault.
pub struct Reconciler {
    mirror: Arc<dyn MirrorRepositoryTrait>,
    storage_timeout: Duration,
}

impl Reconciler {
    pub fn new(mirror: Arc<dyn MirrorRepositoryTrait>, storage_timeout: Duration) -> Self {
        Self {
            mirror,
            storage_timeout,
        }
    }

    pub async fn reconcile(&self, event: &ChangeEvent) -> ReconcileOutcome {
        let key = event.key();
        trace_state(&key, ReconcileState::Received);

        trace_state(&key, ReconcileState::Mapping);
        let change = match map_change(event) {
            Ok(change) => change,
            Err(err) => {
                warn!("[Reconciler] Mapping failed for {}: {}", key, err);
                return self.fail(Error::from(err));
            }
        };
        let revision = event.revision(&change);

        trace_state(&key, ReconcileState::Deciding);
        let lookup = {
            let mirror = self.mirror.clone();
            let key = key.clone();
            tokio::time::timeout(
                self.storage_timeout,
                tokio::task::spawn_blocking(move || mirror.get_revision(&key)),
            )
            .await
        };
        let stored = match lookup {
            Ok(Ok(Ok(record))) => record.map(|r| r.revision),
            Ok(Ok(Err(err))) => return self.fail(err),
            Ok(Err(join_err)) => {
                return self.fail(Error::Database(DatabaseError::Internal(format!(
                    "revision lookup for {} aborted: {}",
                    key, join_err
                ))))
            }
            Err(_) => {
                warn!(
                    "[Reconciler] Revision lookup for {} exceeded {:?}",
                    key, self.storage_timeout
                );
                return self.fail(Error::Timeout(format!(
                    "revision lookup for {} exceeded {:?}",
                    key, self.storage_timeout
                )));
            }
        };
        let decision = should_apply(stored.as_ref(), &revision);
        if !decision.should_write() {
            debug!(
                "[Reconciler] Skipping {} at {}: not newer than stored revision",
                key, revision.updated_at_ms
            );
            return ReconcileOutcome::Skipped { revision };
        }

        trace_state(&key, ReconcileState::Applying);
        let applied = tokio::time::timeout(
            self.storage_timeout,
            self.mirror.apply_change(change, revision.clone()),
        )
        .await;
        match applied {
            Ok(Ok(ApplyResult::Applied(decision))) => {
                debug!("[Reconciler] Applied {} ({:?})", key, decision);
                ReconcileOutcome::Applied { decision, revision }
            }
            Ok(Ok(ApplyResult::Stale)) => {
                debug!("[Reconciler] {} superseded while applying", key);
                ReconcileOutcome::Skipped { revision }
            }
            Ok(Err(err)) => {
                warn!("[Reconciler] Apply failed for {}: {}", key, err);
                self.fail(err)
            }
            Err(_) => {
                warn!(
                    "[Reconciler] Apply for {} exceeded {:?}",
                    key, self.storage_timeout
                );
                self.fail(Error::Timeout(format!(
                    "storage transaction for {} exceeded {:?}",
                    key, self.storage_timeout
                )))
            }
        }
    }

    fn fail(&self, err: Error) -> ReconcileOutcome {
        ReconcileOutcome::Failed(SyncFailure::from_error(&err))
    }
}

fn trace_state(key: &crate::entities::EntityKey, state: ReconcileState) {
    log::trace!("[Reconciler] {} -> {:?}", key, state);
}
