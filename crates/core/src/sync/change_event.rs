//! The unit of work flowing from the ingest pipelines into the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::entities::{EntityKey, EntityKind, MappedChange};

/// Feed an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// Normalized change produced by the webhook pipeline or a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub source: EventSource,
    pub kind: EntityKind,
    pub op: ChangeOp,
    pub store_id: String,
    pub external_id: String,
    pub payload: Value,
    pub observed_at: DateTime<Utc>,
    /// Position hint from the producer (listing offset); informational only.
    pub sequence_hint: Option<i64>,
}

impl ChangeEvent {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.store_id.clone(), self.kind, self.external_id.clone())
    }

    /// Revision of this event once mapped. The platform `updated_at` orders
    /// it, or the receipt time without one; ties compare the mapped content.
    pub fn revision(&self, change: &MappedChange) -> Revision {
        Revision {
            updated_at_ms: change
                .updated_at()
                .unwrap_or(self.observed_at)
                .timestamp_millis(),
            content_hash: change.content_hash(),
        }
    }
}

/// Canonical hash of a JSON document. Object keys serialize in sorted order,
/// so logically equal payloads hash equally regardless of key order.
pub fn content_hash(payload: &Value) -> String {
    let canonical = payload.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

/// Totally ordered entity revision: timestamp first, content hash on ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub updated_at_ms: i64,
    pub content_hash: String,
}
