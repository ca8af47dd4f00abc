//! Engine settings supplied at startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::entities::EntityKind;
use crate::errors::{Error, Result};

/// Default platform admin API base.
pub const DEFAULT_API_BASE_URL: &str = "https://api.salla.dev/admin/v2";

/// Credentials and webhook secret for one mirrored store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCredentials {
    pub store_id: String,
    pub access_token: String,
    pub webhook_secret: String,
}

// Keep secrets out of logs.
impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("store_id", &self.store_id)
            .field("access_token", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .finish()
    }
}

/// Opaque settings object consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub stores: Vec<StoreCredentials>,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Page size for listing calls.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    #[serde(default = "default_webhook_staleness_secs")]
    pub webhook_staleness_secs: i64,
    /// Width of the rolled-up sync log window for webhook and retry applies.
    #[serde(default = "default_webhook_window_secs")]
    pub webhook_window_secs: i64,
    #[serde(default = "default_reconciler_shards")]
    pub reconciler_shards: usize,
    #[serde(default = "default_shard_queue_depth")]
    pub shard_queue_depth: usize,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Rate-limit pauses longer than this are logged as warnings.
    #[serde(default = "default_rate_limit_pause_ceiling_secs")]
    pub rate_limit_pause_ceiling_secs: u64,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,
    #[serde(default = "default_page_fetch_max_attempts")]
    pub page_fetch_max_attempts: u32,
    #[serde(default = "default_pull_kinds")]
    pub pull_kinds: Vec<EntityKind>,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_sync_interval_secs() -> u64 {
    15 * 60
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_secs() -> u64 {
    5
}

fn default_retry_max_delay_secs() -> u64 {
    10 * 60
}

fn default_webhook_staleness_secs() -> i64 {
    5 * 60
}

fn default_webhook_window_secs() -> i64 {
    5 * 60
}

fn default_reconciler_shards() -> usize {
    8
}

fn default_shard_queue_depth() -> usize {
    1024
}

fn default_requests_per_minute() -> u32 {
    120
}

fn default_rate_limit_pause_ceiling_secs() -> u64 {
    60
}

fn default_api_timeout_secs() -> u64 {
    30
}

fn default_storage_timeout_secs() -> u64 {
    10
}

fn default_page_fetch_max_attempts() -> u32 {
    5
}

fn default_pull_kinds() -> Vec<EntityKind> {
    EntityKind::ALL
        .iter()
        .copied()
        .filter(EntityKind::is_listable)
        .collect()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            stores: Vec::new(),
            sync_interval_secs: default_sync_interval_secs(),
            batch_size: default_batch_size(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            webhook_staleness_secs: default_webhook_staleness_secs(),
            webhook_window_secs: default_webhook_window_secs(),
            reconciler_shards: default_reconciler_shards(),
            shard_queue_depth: default_shard_queue_depth(),
            requests_per_minute: default_requests_per_minute(),
            rate_limit_pause_ceiling_secs: default_rate_limit_pause_ceiling_secs(),
            api_timeout_secs: default_api_timeout_secs(),
            storage_timeout_secs: default_storage_timeout_secs(),
            page_fetch_max_attempts: default_page_fetch_max_attempts(),
            pull_kinds: default_pull_kinds(),
        }
    }
}

impl SyncSettings {
    /// Fails fast on settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(Error::Config("apiBaseUrl must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batchSize must be positive".to_string()));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::Config("maxRetryAttempts must be positive".to_string()));
        }
        if self.reconciler_shards == 0 || self.shard_queue_depth == 0 {
            return Err(Error::Config(
                "reconcilerShards and shardQueueDepth must be positive".to_string(),
            ));
        }
        if self.requests_per_minute == 0 {
            return Err(Error::Config("requestsPerMinute must be positive".to_string()));
        }
        if self.webhook_staleness_secs <= 0 || self.webhook_window_secs <= 0 {
            return Err(Error::Config(
                "webhookStalenessSecs and webhookWindowSecs must be positive".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for store in &self.stores {
            if store.store_id.trim().is_empty() {
                return Err(Error::Config("store entry without storeId".to_string()));
            }
            if store.webhook_secret.is_empty() {
                return Err(Error::Config(format!(
                    "store '{}' has an empty webhookSecret",
                    store.store_id
                )));
            }
            if !seen.insert(store.store_id.as_str()) {
                return Err(Error::Config(format!(
                    "store '{}' is configured twice",
                    store.store_id
                )));
            }
        }
        if let Some(kind) = self.pull_kinds.iter().find(|kind| !kind.is_listable()) {
            return Err(Error::Config(format!("{} cannot be pulled", kind)));
        }
        Ok(())
    }

    pub fn store(&self, store_id: &str) -> Option<&StoreCredentials> {
        self.stores.iter().find(|s| s.store_id == store_id)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn rate_limit_pause_ceiling(&self) -> Duration {
        Duration::from_secs(self.rate_limit_pause_ceiling_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: SyncSettings = serde_json::from_str(
            r#"{"stores":[{"storeId":"s1","accessToken":"t","webhookSecret":"w"}]}"#,
        )
        .expect("parse settings");
        assert_eq!(settings.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.max_retry_attempts, 5);
        assert!(!settings.pull_kinds.contains(&EntityKind::OrderItem));
        settings.validate().expect("valid settings");
    }

    #[test]
    fn duplicate_stores_are_rejected() {
        let store = StoreCredentials {
            store_id: "s1".to_string(),
            access_token: "t".to_string(),
            webhook_secret: "w".to_string(),
        };
        let settings = SyncSettings {
            stores: vec![store.clone(), store],
            ..SyncSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let store = StoreCredentials {
            store_id: "s1".to_string(),
            access_token: "token-value".to_string(),
            webhook_secret: "secret-value".to_string(),
        };
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("token-value"));
        assert!(!rendered.contains("secret-value"));
    }
}
