//! Retry classification, backoff and dead-letter models.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ChangeEvent;
use crate::entities::EntityKind;
use crate::settings::SyncSettings;

/// Retry policy classification for failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 409 | 423 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Category of a failed reconcile attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientStorage,
    Referential,
    Mapping,
    Auth,
    RateLimit,
    ExhaustedRetry,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl SyncFailure {
    pub fn from_error(err: &crate::errors::Error) -> Self {
        Self {
            kind: err.failure_kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Exponential backoff with up to 20% additive jitter, capped at `max`.
pub fn backoff_with_jitter(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.min(16);
    let raw = base.saturating_mul(1_u32 << exponent).min(max);
    let jitter_cap_ms = (raw.as_millis() / 5) as u64;
    let jitter_ms = if jitter_cap_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_cap_ms)
    } else {
        0
    };
    (raw + Duration::from_millis(jitter_ms)).min(max)
}

/// Bounded exponential retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Missing parents usually arrive within seconds, so their delay stays short.
    pub referential_max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        let max_delay = Duration::from_secs(settings.retry_max_delay_secs.max(1));
        Self {
            max_attempts: settings.max_retry_attempts.max(1),
            base_delay: Duration::from_secs(settings.retry_base_delay_secs.max(1)),
            max_delay,
            referential_max_delay: max_delay.min(Duration::from_secs(60)),
        }
    }

    /// Delay before attempt number `attempt` (1-based) of a unit that failed with `kind`.
    pub fn delay_for(&self, attempt: u32, kind: FailureKind) -> Duration {
        let cap = match kind {
            FailureKind::Referential => self.referential_max_delay,
            _ => self.max_delay,
        };
        backoff_with_jitter(self.base_delay, attempt.saturating_sub(1), cap)
    }

    /// Whether a unit that has failed `attempts` times may still be retried.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Persisted unit of work awaiting its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryUnit {
    pub id: String,
    pub store_id: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub event: ChangeEvent,
    /// Failed attempts so far.
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub failure_kind: FailureKind,
    pub last_error: String,
    pub created_at: String,
}

/// Unit parked after exhausting retries or failing permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub store_id: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub reason: FailureKind,
    pub last_error: String,
    pub attempts: u32,
    pub event: ChangeEvent,
    pub created_at: String,
    pub resubmitted_at: Option<String>,
}
