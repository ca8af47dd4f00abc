//! Partitioned work queue in front of the reconciler.
//!
//! Events are routed to a shard by entity key, and each shard applies its
//! events one at a time, so two applies for the same entity never overlap.

use chrono::Utc;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::{
    ChangeEvent, ReconcileOutcome, Reconciler, RetryDisposition, RetryManager,
    SyncLogRepositoryTrait, SyncProgress, SyncType, SyncWindow,
};
use crate::entities::{derive_child_events, EntityKey};
use crate::errors::{Error, Result};

/// Why a unit entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrigin {
    Webhook,
    Pull,
    Retry,
    Manual,
}

impl WorkOrigin {
    /// Rolled-up log row this origin counts into. Pulls keep their own batch log.
    fn rollup_type(&self) -> Option<SyncType> {
        match self {
            Self::Webhook => Some(SyncType::Webhook),
            Self::Retry | Self::Manual => Some(SyncType::Retry),
            Self::Pull => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub event: ChangeEvent,
    pub origin: WorkOrigin,
    /// Failed attempts before this one.
    pub attempt: u32,
    pub retry_id: Option<String>,
}

impl WorkUnit {
    pub fn new(event: ChangeEvent, origin: WorkOrigin) -> Self {
        Self {
            event,
            origin,
            attempt: 0,
            retry_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("reconciler queue is full")]
    QueueFull,
    #[error("reconciler workers have stopped")]
    Closed,
}

struct Job {
    unit: WorkUnit,
    reply: oneshot::Sender<ReconcileOutcome>,
}

/// Outcome of a submitted unit, delivered once its shard has processed it.
pub struct PendingOutcome(oneshot::Receiver<ReconcileOutcome>);

impl PendingOutcome {
    pub async fn wait(self) -> Result<ReconcileOutcome> {
        self.0
            .await
            .map_err(|_| Error::Cancelled("reconciler worker dropped the unit".to_string()))
    }
}

/// Collaborators shared by every shard worker.
pub struct DispatcherContext {
    pub reconciler: Arc<Reconciler>,
    pub retries: Arc<RetryManager>,
    pub sync_log: Arc<dyn SyncLogRepositoryTrait>,
    pub window_secs: i64,
}

#[derive(Clone)]
pub struct SyncDispatcher {
    shards: Arc<Vec<mpsc::Sender<Job>>>,
}

impl SyncDispatcher {
    /// Spawns `shard_count` workers on the current tokio runtime.
    pub fn spawn(context: DispatcherContext, shard_count: usize, queue_depth: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            senders.push(tx);
            receivers.push(rx);
        }
        let dispatcher = Self {
            shards: Arc::new(senders),
        };
        let context = Arc::new(context);
        for (shard, rx) in receivers.into_iter().enumerate() {
            tokio::spawn(run_shard(shard, rx, context.clone(), dispatcher.clone()));
        }
        dispatcher
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, key: &EntityKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queues a unit, waiting for shard capacity.
    pub async fn submit(&self, unit: WorkUnit) -> std::result::Result<PendingOutcome, DispatchError> {
        let shard = self.shard_for(&unit.event.key());
        let (reply, rx) = oneshot::channel();
        self.shards[shard]
            .send(Job { unit, reply })
            .await
            .map_err(|_| DispatchError::Closed)?;
        Ok(PendingOutcome(rx))
    }

    /// Queues a unit without waiting; fails when the shard is full.
    pub fn try_submit(&self, unit: WorkUnit) -> std::result::Result<PendingOutcome, DispatchError> {
        let shard = self.shard_for(&unit.event.key());
        let (reply, rx) = oneshot::channel();
        self.shards[shard]
            .try_send(Job { unit, reply })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            })?;
        Ok(PendingOutcome(rx))
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<Job>,
    context: Arc<DispatcherContext>,
    dispatcher: SyncDispatcher,
) {
    while let Some(Job { unit, reply }) = rx.recv().await {
        let outcome = context.reconciler.reconcile(&unit.event).await;

        let disposition = match context.retries.handle_outcome(&unit, &outcome).await {
            Ok(disposition) => Some(disposition),
            Err(err) => {
                error!(
                    "[Dispatcher] shard {}: retry bookkeeping failed for {}: {}",
                    shard,
                    unit.event.key(),
                    err
                );
                None
            }
        };

        record_rollup(&context, &unit, &outcome, disposition.as_ref()).await;

        if matches!(outcome, ReconcileOutcome::Applied { .. }) {
            for child in derive_child_events(&unit.event) {
                let dispatcher = dispatcher.clone();
                let child_unit = WorkUnit::new(child, unit.origin);
                // Sent from a separate task so a full sibling shard cannot block this one.
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.submit(child_unit).await {
                        warn!("[Dispatcher] Could not queue order item: {}", err);
                    }
                });
            }
        }

        let _ = reply.send(outcome);
    }
}

async fn record_rollup(
    context: &DispatcherContext,
    unit: &WorkUnit,
    outcome: &ReconcileOutcome,
    disposition: Option<&RetryDisposition>,
) {
    let sync_type = match unit.origin.rollup_type() {
        Some(sync_type) => sync_type,
        None => return,
    };
    let (delta, last_error) = match outcome {
        ReconcileOutcome::Applied { .. } => (SyncProgress::applied(), None),
        ReconcileOutcome::Skipped { .. } => (SyncProgress::skipped(), None),
        ReconcileOutcome::Failed(failure) => {
            let message = match disposition {
                Some(RetryDisposition::DeadLettered { reason, attempts }) => format!(
                    "{} dead-lettered after {} attempt(s) ({:?}): {}",
                    unit.event.key(),
                    attempts,
                    reason,
                    failure.message
                ),
                _ => format!("{}: {}", unit.event.key(), failure.message),
            };
            (SyncProgress::failed(), Some(message))
        }
    };
    let window = SyncWindow::containing(
        unit.event.store_id.clone(),
        sync_type,
        Utc::now(),
        context.window_secs,
    );
    if let Err(err) = context
        .sync_log
        .record_window_outcome(window, delta, last_error)
        .await
    {
        warn!("[Dispatcher] Could not record {:?} outcome: {}", sync_type, err);
    }
}
