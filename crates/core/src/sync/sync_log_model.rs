//! Sync log, pull checkpoint and watermark models.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::EntityKind;
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Incremental,
    Webhook,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One pull batch, or one rolled-up window of webhook/retry applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: String,
    pub store_id: String,
    pub sync_type: SyncType,
    /// Set for pull batches.
    pub entity_kind: Option<EntityKind>,
    pub status: SyncStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub records_processed: i64,
    pub records_success: i64,
    pub records_failed: i64,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// Start of the rollup window for webhook and retry rows.
    pub window_start: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncLog {
    pub store_id: String,
    pub sync_type: SyncType,
    pub entity_kind: Option<EntityKind>,
}

/// Counter increments applied to a log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub processed: i64,
    pub success: i64,
    pub failed: i64,
}

impl SyncProgress {
    pub fn applied() -> Self {
        Self {
            processed: 1,
            success: 1,
            failed: 0,
        }
    }

    pub fn skipped() -> Self {
        Self {
            processed: 1,
            success: 0,
            failed: 0,
        }
    }

    pub fn failed() -> Self {
        Self {
            processed: 1,
            success: 0,
            failed: 1,
        }
    }

    pub fn add(&mut self, other: SyncProgress) {
        self.processed += other.processed;
        self.success += other.success;
        self.failed += other.failed;
    }

    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.success == 0 && self.failed == 0
    }

    /// Counters never go negative and outcomes never exceed processed records.
    pub fn validate(&self) -> Result<()> {
        if self.processed < 0 || self.success < 0 || self.failed < 0 {
            return Err(Error::InvalidInput(format!(
                "negative sync progress {:?}",
                self
            )));
        }
        if self.success + self.failed > self.processed {
            return Err(Error::InvalidInput(format!(
                "sync progress {:?} counts more outcomes than records",
                self
            )));
        }
        Ok(())
    }
}

/// Terminal error attached to a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogError {
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl SyncLogError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Completion of a pull batch; advances the watermark when the pull completed.
#[derive(Debug, Clone, PartialEq)]
pub struct PullCompletion {
    pub store_id: String,
    pub kind: EntityKind,
    pub status: SyncStatus,
    /// Crawl start time; written as the new watermark on `Completed`.
    pub watermark: DateTime<Utc>,
    pub error: Option<SyncLogError>,
}

/// Rolled-up log row identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncWindow {
    pub store_id: String,
    pub sync_type: SyncType,
    pub window_start: DateTime<Utc>,
}

impl SyncWindow {
    /// Window of width `window_secs` containing `at`.
    pub fn containing(
        store_id: impl Into<String>,
        sync_type: SyncType,
        at: DateTime<Utc>,
        window_secs: i64,
    ) -> Self {
        let width = window_secs.max(1);
        let start_secs = at.timestamp().div_euclid(width) * width;
        let window_start = Utc
            .timestamp_opt(start_secs, 0)
            .single()
            .unwrap_or(at);
        Self {
            store_id: store_id.into(),
            sync_type,
            window_start,
        }
    }

    pub fn end(&self, window_secs: i64) -> DateTime<Utc> {
        self.window_start + Duration::seconds(window_secs.max(1))
    }
}

/// Resume point for a paginated pull of one (store, kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCheckpoint {
    pub store_id: String,
    pub kind: EntityKind,
    pub sync_type: SyncType,
    /// First page not yet fully processed.
    pub next_page: u32,
    pub log_id: String,
    pub since: Option<DateTime<Utc>>,
    pub crawl_started_at: DateTime<Utc>,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_rejects_more_outcomes_than_records() {
        let bad = SyncProgress {
            processed: 1,
            success: 1,
            failed: 1,
        };
        assert!(bad.validate().is_err());
        assert!(SyncProgress::skipped().validate().is_ok());
    }

    #[test]
    fn window_is_aligned_to_its_width() {
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 10, 7, 31).unwrap();
        let window = SyncWindow::containing("s1", SyncType::Webhook, at, 300);
        assert_eq!(
            window.window_start,
            Utc.with_ymd_and_hms(2026, 5, 1, 10, 5, 0).unwrap()
        );
        assert_eq!(
            window.end(300),
            Utc.with_ymd_and_hms(2026, 5, 1, 10, 10, 0).unwrap()
        );
    }
}
