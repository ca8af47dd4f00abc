use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use salla_mirror_core::sync::{DispatchError, WebhookRequest, WorkOrigin, WorkUnit};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

pub const SIGNATURE_HEADER: &str = "x-salla-signature";

/// Verifies and decodes the event, then hands it to the reconciler queue
/// without waiting for the apply.
async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let event = state.ingest.ingest(WebhookRequest {
        store_id: &store_id,
        signature,
        body: &body,
        received_at: Utc::now(),
    })?;

    let Some(event) = event else {
        return Ok(Json(json!({ "status": "ignored" })));
    };
    let external_id = event.external_id.clone();
    match state
        .dispatcher
        .try_submit(WorkUnit::new(event, WorkOrigin::Webhook))
    {
        Ok(_) => Ok(Json(json!({ "status": "accepted", "externalId": external_id }))),
        Err(DispatchError::QueueFull) => {
            warn!("Reconciler queue full, shedding webhook for store {}", store_id);
            Err(ApiError::Unavailable("reconciler queue is full".to_string()))
        }
        Err(err @ DispatchError::Closed) => Err(ApiError::Unavailable(err.to_string())),
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/:store_id", post(receive_webhook))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_util::{eventually, get, send};
    use crate::main_lib::app_router;
    use crate::main_lib::test_support::{test_state, STORE_ID, WEBHOOK_SECRET};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Duration;
    use salla_mirror_core::entities::{EntityKey, EntityKind};
    use salla_mirror_core::sync::{sign_payload, MirrorRepositoryTrait};

    fn order_event(created: chrono::DateTime<Utc>) -> Vec<u8> {
        json!({
            "event": "order.created",
            "merchant": STORE_ID,
            "created_at": created.to_rfc3339(),
            "data": {
                "id": 501,
                "reference_id": "R-501",
                "status": "under_review",
                "amounts": { "total": { "amount": "99.50", "currency": "SAR" } },
                "updated_at": created.to_rfc3339(),
            }
        })
        .to_string()
        .into_bytes()
    }

    fn webhook_request(store_id: &str, body: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::post(format!("/api/v1/webhooks/{}", store_id))
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body)).expect("request")
    }

    fn signed(store_id: &str, body: Vec<u8>) -> Request<Body> {
        let signature = sign_payload(WEBHOOK_SECRET, &body).unwrap();
        webhook_request(store_id, body, Some(signature))
    }

    #[tokio::test]
    async fn signed_event_is_accepted_and_applied() {
        let (state, _) = test_state();
        let app = app_router(state.clone());

        let (status, body) = send(&app, signed(STORE_ID, order_event(Utc::now()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");

        let key = EntityKey::new(STORE_ID, EntityKind::Order, "501");
        assert!(eventually(|| state.mirror.get_row(&key).unwrap().is_some()).await);

        let logs_uri = format!("/api/v1/stores/{}/sync-logs", STORE_ID);
        let mut logged = false;
        for _ in 0..50 {
            let (_, logs) = send(&app, get(&logs_uri)).await;
            if logs[0]["recordsSuccess"] == 1 {
                assert_eq!(logs[0]["syncType"], "webhook");
                logged = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(logged);
    }

    #[tokio::test]
    async fn tampered_body_is_unauthorized() {
        let (state, _) = test_state();
        let body = order_event(Utc::now());
        let signature = sign_payload(WEBHOOK_SECRET, &body).unwrap();
        let mut tampered = body.clone();
        let last = tampered.len() - 2;
        tampered[last] = b' ';

        let (status, _) = send(
            &app_router(state),
            webhook_request(STORE_ID, tampered, Some(signature)),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_signature_and_unknown_store_are_unauthorized() {
        let (state, _) = test_state();
        let app = app_router(state);

        let (status, _) = send(&app, webhook_request(STORE_ID, order_event(Utc::now()), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, signed("s9", order_event(Utc::now()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn replayed_event_is_rejected_as_stale() {
        let (state, _) = test_state();
        let old = Utc::now() - Duration::hours(2);

        let (status, body) = send(&app_router(state), signed(STORE_ID, order_event(old))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "stale_event");
    }

    #[tokio::test]
    async fn future_dated_event_is_rejected() {
        let (state, _) = test_state();
        let ahead = Utc::now() + Duration::hours(3);

        let (status, body) = send(&app_router(state), signed(STORE_ID, order_event(ahead))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "stale_event");
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let (state, _) = test_state();
        let (status, body) = send(&app_router(state), signed(STORE_ID, b"{\"event\":".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "malformed_event");
    }
}
