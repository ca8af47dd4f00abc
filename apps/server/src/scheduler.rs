//! Background loops: periodic pulls, the retry pump and the sync log window sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use salla_mirror_core::sync::{SyncLogRepositoryTrait, SyncType, SyncWindow};

use crate::main_lib::AppState;

const RETRY_PUMP_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_PUMP_BATCH: i64 = 100;

pub fn spawn_background(state: Arc<AppState>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(pull_loop(state.clone())),
        tokio::spawn(retry_loop(state.clone())),
        tokio::spawn(window_sweep_loop(state)),
    ]
}

/// Starts a round of scheduled pulls once per sync interval. Rounds run in the
/// background, so a store still busy with the previous round never delays the
/// next one for the others; its busy slots are skipped.
async fn pull_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.settings.sync_interval());
    let mut rounds = JoinSet::new();
    loop {
        ticker.tick().await;
        if state.shutdown.is_cancelled() {
            break;
        }
        while rounds.try_join_next().is_some() {}
        rounds.spawn(run_scheduled_pulls(state.clone()));
    }
    debug!("Pull loop stopped");
}

/// Pulls every store concurrently, one task per store. Within a store, kinds
/// run in configured order so parents land before their children.
pub async fn run_scheduled_pulls(state: Arc<AppState>) {
    let mut stores = JoinSet::new();
    for store in &state.settings.stores {
        stores.spawn(pull_store(state.clone(), store.store_id.clone()));
    }
    while let Some(joined) = stores.join_next().await {
        if let Err(err) = joined {
            error!("Scheduled pull task failed: {}", err);
        }
    }
}

async fn pull_store(state: Arc<AppState>, store_id: String) {
    for kind in &state.settings.pull_kinds {
        if state.shutdown.is_cancelled() {
            return;
        }
        let mode = match state.default_pull_mode(&store_id, *kind) {
            Ok(mode) => mode,
            Err(err) => {
                warn!("Cannot plan pull of {}/{}: {}", store_id, kind, err);
                continue;
            }
        };
        if !state.claim_pull(&store_id, *kind).await {
            debug!("Pull of {}/{} already running, skipping", store_id, kind);
            continue;
        }
        if let Ok(summary) = state.run_claimed_pull(&store_id, *kind, mode).await {
            info!(
                "Scheduled {:?} pull of {}/{}: {:?}",
                summary.mode, store_id, kind, summary.progress
            );
        }
    }
}

async fn retry_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(RETRY_PUMP_INTERVAL);
    loop {
        ticker.tick().await;
        if state.shutdown.is_cancelled() {
            break;
        }
        if let Err(err) = state.retries.pump(&state.dispatcher, RETRY_PUMP_BATCH).await {
            warn!("Retry pump failed: {}", err);
        }
    }
    debug!("Retry loop stopped");
}

async fn window_sweep_loop(state: Arc<AppState>) {
    let window_secs = state.settings.webhook_window_secs.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(window_secs as u64));
    loop {
        ticker.tick().await;
        if state.shutdown.is_cancelled() {
            break;
        }
        let current = SyncWindow::containing("", SyncType::Webhook, Utc::now(), window_secs);
        match state.sync_log.close_windows_before(current.window_start).await {
            Ok(0) => {}
            Ok(closed) => debug!("Closed {} sync log windows", closed),
            Err(err) => warn!("Window sweep failed: {}", err),
        }
    }
    debug!("Window sweep loop stopped");
}
