//! Internal row representation produced by the mapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{EntityKey, EntityKind};
use crate::sync::content_hash;

/// Reference from a mapped row to its parent, resolved to an internal id at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    /// Internal foreign-key column on the child table.
    pub column: &'static str,
    pub kind: EntityKind,
    pub external_id: String,
}

/// Column set for one upsert by natural key.
///
/// Column values are JSON scalars; arrays and objects are stored as JSON text.
/// Decimal amounts are carried as strings to keep their precision.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub kind: EntityKind,
    pub store_id: String,
    pub external_id: String,
    pub columns: BTreeMap<String, Value>,
    pub parents: Vec<ParentRef>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MappedRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.store_id.clone(), self.kind, self.external_id.clone())
    }
}

/// What the storage layer must do for one change.
#[derive(Debug, Clone, PartialEq)]
pub enum MappedChange {
    Upsert(MappedRow),
    /// Soft delete; the row keeps its columns and gets `deleted_at` set.
    Delete {
        key: EntityKey,
        updated_at: Option<DateTime<Utc>>,
    },
}

impl MappedChange {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Upsert(row) => row.key(),
            Self::Delete { key, .. } => key.clone(),
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Upsert(row) => row.updated_at,
            Self::Delete { updated_at, .. } => *updated_at,
        }
    }

    /// Hash of what the change writes: mapped columns and parent references.
    /// Payload fields the mapper drops never reach it.
    pub fn content_hash(&self) -> String {
        match self {
            Self::Upsert(row) => {
                let parents: Vec<Value> = row
                    .parents
                    .iter()
                    .map(|parent| json!([parent.column, parent.kind, parent.external_id]))
                    .collect();
                content_hash(&json!({ "columns": row.columns, "parents": parents }))
            }
            Self::Delete { .. } => content_hash(&json!({ "deleted": true })),
        }
    }
}

/// A mirrored row as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalRow {
    pub id: i64,
    pub kind: EntityKind,
    pub store_id: String,
    pub external_id: String,
    pub last_sync: String,
    pub deleted_at: Option<String>,
    /// Mapped attribute columns, including resolved internal foreign keys.
    pub columns: BTreeMap<String, Value>,
}

impl InternalRow {
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
