//! Inbound webhook verification and decoding.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;

use super::{ChangeEvent, ChangeOp, EventSource};
use crate::entities::{parse_platform_datetime, EntityKind};
use crate::errors::WebhookError;
use crate::settings::SyncSettings;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-salla-signature";

/// Hex HMAC-SHA256 of `body` under `secret`, as the platform sends it.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| WebhookError::Signature(err.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature, optionally prefixed with `sha256=`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = hex::decode(signature)
        .map_err(|_| WebhookError::Signature("signature is not hex".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| WebhookError::Signature(err.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::Signature("signature mismatch".to_string()))
}

/// Raw inbound request as seen by the HTTP layer.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub store_id: &'a str,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
    pub received_at: DateTime<Utc>,
}

/// How far ahead of the receipt time a `created` stamp may be.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Turns a raw request into zero or one change event, or a rejection.
/// Never touches storage.
pub struct WebhookIngest {
    secrets: HashMap<String, String>,
    staleness: Duration,
}

impl WebhookIngest {
    pub fn new(secrets: HashMap<String, String>, staleness_secs: i64) -> Self {
        Self {
            secrets,
            staleness: Duration::seconds(staleness_secs.max(1)),
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        let secrets = settings
            .stores
            .iter()
            .map(|store| (store.store_id.clone(), store.webhook_secret.clone()))
            .collect();
        Self::new(secrets, settings.webhook_staleness_secs)
    }

    pub fn ingest(&self, request: WebhookRequest<'_>) -> Result<Option<ChangeEvent>, WebhookError> {
        let result = self.decode(request);
        match &result {
            Ok(Some(event)) => info!(
                "[Webhook] Accepted {} {:?} {} for store {}",
                event.kind, event.op, event.external_id, event.store_id
            ),
            Ok(None) => {}
            Err(err) => warn!(
                "[Webhook] Rejected request for store {}: {}",
                request.store_id, err
            ),
        }
        result
    }

    fn decode(&self, request: WebhookRequest<'_>) -> Result<Option<ChangeEvent>, WebhookError> {
        let secret = self
            .secrets
            .get(request.store_id)
            .ok_or_else(|| WebhookError::UnknownStore(request.store_id.to_string()))?;
        let signature = request
            .signature
            .ok_or_else(|| WebhookError::Signature("missing signature header".to_string()))?;
        verify_signature(secret, request.body, signature)?;

        let body: Value = serde_json::from_slice(request.body)
            .map_err(|err| WebhookError::Malformed(format!("invalid JSON: {}", err)))?;
        let event_name = body
            .get("event")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| WebhookError::Malformed("missing event name".to_string()))?;

        if let Some(merchant) = body.get("merchant").filter(|v| !v.is_null()) {
            let merchant = match merchant {
                Value::String(id) => id.clone(),
                other => other.to_string(),
            };
            if merchant != request.store_id {
                return Err(WebhookError::Malformed(format!(
                    "merchant '{}' does not match store '{}'",
                    merchant, request.store_id
                )));
            }
        }

        let created = body
            .get("created")
            .or_else(|| body.get("created_at"))
            .and_then(parse_platform_datetime)
            .ok_or_else(|| WebhookError::Malformed("missing or invalid created timestamp".to_string()))?;
        let age = request.received_at - created;
        if age > self.staleness {
            return Err(WebhookError::Stale {
                age_secs: age.num_seconds(),
                window_secs: self.staleness.num_seconds(),
            });
        }
        let skew = self.staleness.min(Duration::seconds(MAX_CLOCK_SKEW_SECS));
        if -age > skew {
            return Err(WebhookError::FromFuture {
                ahead_secs: (-age).num_seconds(),
                skew_secs: skew.num_seconds(),
            });
        }

        let object = embedded_object(&body)?;

        let mut segments = event_name.split('.');
        let prefix = segments.next().unwrap_or_default();
        let kind = match EntityKind::from_event_prefix(prefix) {
            Some(kind) => kind,
            None => {
                debug!("[Webhook] Ignoring unhandled event '{}'", event_name);
                return Ok(None);
            }
        };
        let op = if event_name.ends_with(".deleted") {
            ChangeOp::Delete
        } else {
            ChangeOp::Upsert
        };

        let external_id = match object.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(Value::Number(id)) if id.is_i64() || id.is_u64() => id.to_string(),
            _ => return Err(WebhookError::Malformed("embedded object has no id".to_string())),
        };

        Ok(Some(ChangeEvent {
            source: EventSource::Webhook,
            kind,
            op,
            store_id: request.store_id.to_string(),
            external_id,
            payload: object.clone(),
            observed_at: request.received_at,
            sequence_hint: None,
        }))
    }
}

/// `data.object` when present, otherwise `data` itself.
fn embedded_object(body: &Value) -> Result<&Value, WebhookError> {
    let data = body
        .get("data")
        .filter(|data| data.is_object())
        .ok_or_else(|| WebhookError::Malformed("missing data object".to_string()))?;
    match data.get("object") {
        Some(object) if object.is_object() => Ok(object),
        Some(_) => Err(WebhookError::Malformed("data.object is not an object".to_string())),
        None => Ok(data),
    }
}
