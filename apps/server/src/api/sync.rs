//! Sync history, dead letters and manual pulls.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use salla_mirror_core::entities::EntityKind;
use salla_mirror_core::errors::Error;
use salla_mirror_core::sync::{DeadLetter, PullMode, SyncLogEntry, SyncLogRepositoryTrait};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    full: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullAccepted {
    store_id: String,
    kind: EntityKind,
    mode: PullMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreSyncStatus {
    store_id: String,
    pending_retries: i64,
    /// Live (not soft-deleted) mirrored rows per kind.
    mirrored_rows: BTreeMap<EntityKind, i64>,
    latest_logs: Vec<SyncLogEntry>,
}

fn ensure_store(state: &AppState, store_id: &str) -> ApiResult<()> {
    if state.is_known_store(store_id) {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("unknown store '{}'", store_id)))
    }
}

async fn list_sync_logs(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<SyncLogEntry>>> {
    ensure_store(&state, &store_id)?;
    Ok(Json(state.sync_log.list_logs(&store_id, query.limit())?))
}

async fn get_store_status(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
) -> ApiResult<Json<StoreSyncStatus>> {
    ensure_store(&state, &store_id)?;
    let mut mirrored_rows = BTreeMap::new();
    for kind in EntityKind::ALL {
        mirrored_rows.insert(kind, state.mirror.count_rows(&store_id, kind)?);
    }
    Ok(Json(StoreSyncStatus {
        pending_retries: state.retry_queue.pending_count(&store_id)?,
        latest_logs: state.sync_log.list_logs(&store_id, 5)?,
        mirrored_rows,
        store_id,
    }))
}

async fn get_sync_log(
    State(state): State<Arc<AppState>>,
    Path(log_id): Path<String>,
) -> ApiResult<Json<SyncLogEntry>> {
    state
        .sync_log
        .get_log(&log_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("sync log '{}'", log_id)))
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<DeadLetter>>> {
    ensure_store(&state, &store_id)?;
    Ok(Json(
        state.retries.list_dead_letters(&store_id, query.limit())?,
    ))
}

async fn resubmit_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeadLetter>> {
    match state.retries.resubmit(&id).await {
        Ok(letter) => {
            info!("Resubmitted dead letter {} ({}/{})", id, letter.kind, letter.external_id);
            Ok(Json(letter))
        }
        Err(Error::InvalidInput(message)) => Err(ApiError::Conflict(message)),
        Err(err) => Err(err.into()),
    }
}

/// Starts a pull in the background. `full=true` forces a full crawl;
/// otherwise the pull is incremental once a watermark exists.
async fn trigger_pull(
    State(state): State<Arc<AppState>>,
    Path((store_id, kind)): Path<(String, String)>,
    Query(query): Query<PullQuery>,
) -> ApiResult<(StatusCode, Json<PullAccepted>)> {
    ensure_store(&state, &store_id)?;
    let kind: EntityKind = kind.parse()?;
    if !kind.is_listable() {
        return Err(ApiError::bad_request(format!("{} cannot be pulled", kind)));
    }
    let mode = if query.full.unwrap_or(false) {
        PullMode::Full
    } else {
        state.default_pull_mode(&store_id, kind)?
    };
    if !state.claim_pull(&store_id, kind).await {
        return Err(ApiError::Conflict(format!(
            "a pull of {}/{} is already running",
            store_id, kind
        )));
    }

    let background = state.clone();
    let spawned_store = store_id.clone();
    tokio::spawn(async move {
        let _ = background.run_claimed_pull(&spawned_store, kind, mode).await;
    });
    info!("Manual {:?} pull of {}/{} started", mode, store_id, kind);

    Ok((
        StatusCode::ACCEPTED,
        Json(PullAccepted {
            store_id,
            kind,
            mode,
        }),
    ))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stores/:store_id/status", get(get_store_status))
        .route("/stores/:store_id/sync-logs", get(list_sync_logs))
        .route("/sync-logs/:log_id", get(get_sync_log))
        .route("/stores/:store_id/dead-letters", get(list_dead_letters))
        .route("/dead-letters/:id/resubmit", post(resubmit_dead_letter))
        .route("/stores/:store_id/pull/:kind", post(trigger_pull))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_util::{get, post, send};
    use crate::main_lib::app_router;
    use crate::main_lib::test_support::{test_state, STORE_ID};
    use chrono::Utc;
    use salla_mirror_core::entities::format_timestamp;
    use salla_mirror_core::sync::{
        ChangeEvent, ChangeOp, EventSource, FailureKind, RetryQueueRepositoryTrait, SyncStatus,
        SyncType,
    };
    use serde_json::json;

    fn dead_letter(id: &str) -> DeadLetter {
        DeadLetter {
            id: id.to_string(),
            store_id: STORE_ID.to_string(),
            kind: EntityKind::Product,
            external_id: "P1".to_string(),
            reason: FailureKind::ExhaustedRetry,
            last_error: "database is locked".to_string(),
            attempts: 5,
            event: ChangeEvent {
                source: EventSource::Webhook,
                kind: EntityKind::Product,
                op: ChangeOp::Upsert,
                store_id: STORE_ID.to_string(),
                external_id: "P1".to_string(),
                payload: json!({
                    "id": "P1",
                    "name": "Mug",
                    "price": { "amount": 10, "currency": "SAR" },
                    "status": "sale",
                }),
                observed_at: Utc::now(),
                sequence_hint: None,
            },
            created_at: format_timestamp(Utc::now()),
            resubmitted_at: None,
        }
    }

    #[tokio::test]
    async fn dead_letters_are_listed_and_resubmitted_once() {
        let (state, _) = test_state();
        state
            .retry_queue
            .move_to_dead_letter(None, dead_letter("d1"))
            .await
            .unwrap();
        let app = app_router(state);

        let (status, letters) =
            send(&app, get(&format!("/api/v1/stores/{}/dead-letters", STORE_ID))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(letters.as_array().unwrap().len(), 1);
        assert_eq!(letters[0]["reason"], "exhausted_retry");

        let (status, letter) = send(&app, post("/api/v1/dead-letters/d1/resubmit")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(letter["resubmittedAt"].is_string());

        let (status, _) = send(&app, post("/api/v1/dead-letters/d1/resubmit")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(&app, post("/api/v1/dead-letters/nope/resubmit")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_pull_runs_in_the_background() {
        let (state, listing) = test_state();
        listing.set_records(
            EntityKind::Product,
            vec![json!({
                "id": 7,
                "name": "Mug",
                "price": { "amount": "15.00", "currency": "SAR" },
                "status": "sale",
                "updated_at": "2026-04-01T08:00:00Z",
            })],
        );
        let app = app_router(state.clone());

        let (status, body) = send(
            &app,
            post(&format!("/api/v1/stores/{}/pull/product?full=true", STORE_ID)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["mode"], "full");

        let mut completed = None;
        for _ in 0..50 {
            let logs = state.sync_log.list_logs(STORE_ID, 10).unwrap();
            if let Some(log) = logs.into_iter().find(|log| log.status == SyncStatus::Completed) {
                completed = Some(log);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let log = completed.expect("completed pull log");
        assert_eq!(log.sync_type, SyncType::Full);
        assert_eq!((log.records_processed, log.records_success), (1, 1));

        let (status, fetched) = send(&app, get(&format!("/api/v1/sync-logs/{}", log.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["entityKind"], "product");

        let (status, summary) = send(&app, get(&format!("/api/v1/stores/{}/status", STORE_ID))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["mirroredRows"]["product"], 1);
        assert_eq!(summary["mirroredRows"]["order"], 0);
        assert_eq!(summary["pendingRetries"], 0);
    }

    #[tokio::test]
    async fn pull_requests_are_validated() {
        let (state, _) = test_state();
        let app = app_router(state.clone());

        let (status, _) = send(&app, post("/api/v1/stores/s9/pull/product")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, post(&format!("/api/v1/stores/{}/pull/order_item", STORE_ID))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, post(&format!("/api/v1/stores/{}/pull/widget", STORE_ID))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(state.claim_pull(STORE_ID, EntityKind::Order).await);
        let (status, _) = send(&app, post(&format!("/api/v1/stores/{}/pull/order", STORE_ID))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_store_logs_are_not_found() {
        let (state, _) = test_state();
        let (status, _) = send(&app_router(state), get("/api/v1/stores/s9/sync-logs")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
