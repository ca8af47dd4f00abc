//! Mirror tables and the idempotency records that guard them.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use log::debug;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use salla_mirror_core::entities::{
    EntityKey, EntityKind, InternalRow, MappedChange, MappedRow, ParentRef,
};
use salla_mirror_core::errors::{DatabaseError, Error, Result};
use salla_mirror_core::sync::{
    should_apply, ApplyResult, IdempotencyRecord, MirrorRepositoryTrait, Revision,
};

use crate::codec::{enum_from_db, enum_to_db, timestamp_to_db};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::sync_idempotency;

/// Columns every mirror table carries besides the mapped attributes.
const SYSTEM_COLUMNS: [&str; 6] = [
    "id",
    "store_id",
    "external_id",
    "last_sync",
    "deleted_at",
    "created_at",
];

pub fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Store => "stores",
        EntityKind::Brand => "brands",
        EntityKind::Category => "categories",
        EntityKind::Product => "products",
        EntityKind::Customer => "customers",
        EntityKind::Order => "orders",
        EntityKind::OrderItem => "order_items",
        EntityKind::Shipment => "shipments",
        EntityKind::Coupon => "coupons",
    }
}

#[derive(Queryable, Insertable, AsChangeset, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = sync_idempotency)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct IdempotencyRecordDB {
    pub store_id: String,
    pub entity_kind: String,
    pub external_id: String,
    pub revision_updated_at_ms: i64,
    pub content_hash: String,
    pub updated_at: String,
}

impl IdempotencyRecordDB {
    fn into_domain(self) -> Result<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            store_id: self.store_id,
            kind: enum_from_db(&self.entity_kind)?,
            external_id: self.external_id,
            revision: Revision {
                updated_at_ms: self.revision_updated_at_ms,
                content_hash: self.content_hash,
            },
            updated_at: self.updated_at,
        })
    }
}

fn table_columns_cache() -> &'static Mutex<HashMap<String, HashSet<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, HashSet<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

fn json_value_to_sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => {
            if *v {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        Value::Number(v) => v.to_string(),
        Value::String(v) => format!("'{}'", escape_sqlite_str(v)),
        Value::Array(_) | Value::Object(_) => {
            format!("'{}'", escape_sqlite_str(&value.to_string()))
        }
    }
}

#[derive(QueryableByName)]
struct PragmaTableXInfoRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    hidden: i32,
}

/// Visible columns of `table_name`, cached per process.
fn table_columns(conn: &mut SqliteConnection, table_name: &str) -> Result<HashSet<String>> {
    let poisoned = || {
        Error::Database(DatabaseError::Internal(
            "Mirror column cache is poisoned".to_string(),
        ))
    };
    if let Some(columns) = table_columns_cache()
        .lock()
        .map_err(|_| poisoned())?
        .get(table_name)
        .cloned()
    {
        return Ok(columns);
    }

    let sql = format!(
        "PRAGMA main.table_xinfo('{}')",
        escape_sqlite_str(table_name)
    );
    let columns = diesel::sql_query(sql)
        .load::<PragmaTableXInfoRow>(conn)
        .map_err(StorageError::from)?
        .into_iter()
        .filter(|row| row.hidden == 0)
        .map(|row| row.name)
        .collect::<HashSet<_>>();
    if columns.is_empty() {
        return Err(Error::Database(DatabaseError::Internal(format!(
            "Mirror table '{}' does not exist",
            table_name
        ))));
    }
    table_columns_cache()
        .lock()
        .map_err(|_| poisoned())?
        .insert(table_name.to_string(), columns.clone());
    Ok(columns)
}

fn validate_row_columns(
    conn: &mut SqliteConnection,
    table_name: &str,
    fields: &[(String, Value)],
) -> Result<()> {
    let known = table_columns(conn, table_name)?;
    for (column, _) in fields {
        if !known.contains(column) {
            return Err(Error::Database(DatabaseError::Internal(format!(
                "Mapped column '{}' is not valid for table '{}'",
                column, table_name
            ))));
        }
    }
    Ok(())
}

#[derive(QueryableByName)]
struct InternalIdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

fn find_internal_id(
    conn: &mut SqliteConnection,
    store_id: &str,
    kind: EntityKind,
    external_id: &str,
) -> Result<Option<i64>> {
    let sql = format!(
        "SELECT id FROM {} WHERE store_id = ? AND external_id = ?",
        quote_identifier(table_for(kind))
    );
    let row = diesel::sql_query(sql)
        .bind::<Text, _>(store_id)
        .bind::<Text, _>(external_id)
        .get_result::<InternalIdRow>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(row.map(|r| r.id))
}

fn resolve_parent(conn: &mut SqliteConnection, store_id: &str, parent: &ParentRef) -> Result<i64> {
    find_internal_id(conn, store_id, parent.kind, &parent.external_id)?.ok_or_else(|| {
        Error::Database(DatabaseError::Referential {
            parent_kind: parent.kind,
            parent_external_id: parent.external_id.clone(),
            message: format!(
                "{} '{}' is not mirrored for store {}",
                parent.kind, parent.external_id, store_id
            ),
        })
    })
}

fn load_revision(conn: &mut SqliteConnection, key: &EntityKey) -> Result<Option<IdempotencyRecord>> {
    let kind_db = enum_to_db(&key.kind)?;
    sync_idempotency::table
        .filter(sync_idempotency::store_id.eq(&key.store_id))
        .filter(sync_idempotency::entity_kind.eq(kind_db))
        .filter(sync_idempotency::external_id.eq(&key.external_id))
        .first::<IdempotencyRecordDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .map(IdempotencyRecordDB::into_domain)
        .transpose()
}

fn upsert_row(conn: &mut SqliteConnection, row: &MappedRow, now: &str) -> Result<()> {
    let table_name = table_for(row.kind);

    let mut fields: Vec<(String, Value)> = vec![
        ("store_id".to_string(), Value::String(row.store_id.clone())),
        ("external_id".to_string(), Value::String(row.external_id.clone())),
    ];
    fields.extend(
        row.columns
            .iter()
            .filter(|(name, _)| !SYSTEM_COLUMNS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone())),
    );
    for parent in &row.parents {
        let parent_id = resolve_parent(conn, &row.store_id, parent)?;
        fields.push((parent.column.to_string(), Value::from(parent_id)));
    }
    fields.push(("last_sync".to_string(), Value::String(now.to_string())));
    fields.push(("deleted_at".to_string(), Value::Null));
    validate_row_columns(conn, table_name, &fields)?;

    let columns = fields
        .iter()
        .map(|(k, _)| quote_identifier(k))
        .collect::<Vec<_>>()
        .join(", ");
    let values = fields
        .iter()
        .map(|(_, v)| json_value_to_sql_literal(v))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = fields
        .iter()
        .filter(|(k, _)| k != "store_id" && k != "external_id")
        .map(|(k, _)| {
            let quoted = quote_identifier(k);
            format!("{quoted}=excluded.{quoted}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "INSERT INTO {} ({columns}) VALUES ({values}) \
         ON CONFLICT(`store_id`, `external_id`) DO UPDATE SET {updates}",
        quote_identifier(table_name)
    );
    diesel::sql_query(sql)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Soft delete. A delete for a row never mirrored only records the revision,
/// so an older upsert arriving later cannot resurrect it.
fn soft_delete_row(conn: &mut SqliteConnection, key: &EntityKey, now: &str) -> Result<usize> {
    let sql = format!(
        "UPDATE {} SET deleted_at = ?, last_sync = ? WHERE store_id = ? AND external_id = ?",
        quote_identifier(table_for(key.kind))
    );
    let affected = diesel::sql_query(sql)
        .bind::<Text, _>(now)
        .bind::<Text, _>(now)
        .bind::<Text, _>(&key.store_id)
        .bind::<Text, _>(&key.external_id)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(affected)
}

fn store_revision(
    conn: &mut SqliteConnection,
    key: &EntityKey,
    revision: &Revision,
    now: &str,
) -> Result<()> {
    let record = IdempotencyRecordDB {
        store_id: key.store_id.clone(),
        entity_kind: enum_to_db(&key.kind)?,
        external_id: key.external_id.clone(),
        revision_updated_at_ms: revision.updated_at_ms,
        content_hash: revision.content_hash.clone(),
        updated_at: now.to_string(),
    };
    diesel::insert_into(sync_idempotency::table)
        .values(&record)
        .on_conflict((
            sync_idempotency::store_id,
            sync_idempotency::entity_kind,
            sync_idempotency::external_id,
        ))
        .do_update()
        .set((
            sync_idempotency::revision_updated_at_ms.eq(record.revision_updated_at_ms),
            sync_idempotency::content_hash.eq(&record.content_hash),
            sync_idempotency::updated_at.eq(&record.updated_at),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn apply_change_tx(
    conn: &mut SqliteConnection,
    change: MappedChange,
    revision: Revision,
) -> Result<ApplyResult> {
    let key = change.key();
    let stored = load_revision(conn, &key)?;
    let decision = should_apply(stored.as_ref().map(|r| &r.revision), &revision);
    if !decision.should_write() {
        return Ok(ApplyResult::Stale);
    }

    let now = timestamp_to_db(Utc::now());
    match &change {
        MappedChange::Upsert(row) => upsert_row(conn, row, &now)?,
        MappedChange::Delete { key, .. } => {
            if soft_delete_row(conn, key, &now)? == 0 {
                debug!("[Storage] Delete for unmirrored {} recorded as tombstone", key);
            }
        }
    }
    store_revision(conn, &key, &revision, &now)?;
    Ok(ApplyResult::Applied(decision))
}

#[derive(QueryableByName)]
struct MirrorRowDB {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    store_id: String,
    #[diesel(sql_type = Text)]
    external_id: String,
    #[diesel(sql_type = Text)]
    last_sync: String,
    #[diesel(sql_type = Nullable<Text>)]
    deleted_at: Option<String>,
    #[diesel(sql_type = Text)]
    columns_json: String,
}

pub struct MirrorRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl MirrorRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    /// Number of live (not soft-deleted) rows of `kind` for a store.
    pub fn count_rows(&self, store_id: &str, kind: EntityKind) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        let sql = format!(
            "SELECT COUNT(*) AS id FROM {} WHERE store_id = ? AND deleted_at IS NULL",
            quote_identifier(table_for(kind))
        );
        let row = diesel::sql_query(sql)
            .bind::<Text, _>(store_id)
            .get_result::<InternalIdRow>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(row.id)
    }

    fn get_row_impl(&self, key: &EntityKey) -> Result<Option<InternalRow>> {
        let mut conn = get_connection(&self.pool)?;
        let table_name = table_for(key.kind);
        let mut attributes = table_columns(&mut conn, table_name)?
            .into_iter()
            .filter(|column| !SYSTEM_COLUMNS.contains(&column.as_str()))
            .collect::<Vec<_>>();
        attributes.sort();
        let pairs = attributes
            .iter()
            .map(|column| format!("'{}', {}", escape_sqlite_str(column), quote_identifier(column)))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "SELECT id, store_id, external_id, last_sync, deleted_at, \
             json_object({pairs}) AS columns_json \
             FROM {} WHERE store_id = ? AND external_id = ?",
            quote_identifier(table_name)
        );
        let row = diesel::sql_query(sql)
            .bind::<Text, _>(&key.store_id)
            .bind::<Text, _>(&key.external_id)
            .get_result::<MirrorRowDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;

        row.map(|row| {
            let columns: BTreeMap<String, Value> = serde_json::from_str(&row.columns_json)?;
            Ok(InternalRow {
                id: row.id,
                kind: key.kind,
                store_id: row.store_id,
                external_id: row.external_id,
                last_sync: row.last_sync,
                deleted_at: row.deleted_at,
                columns,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl MirrorRepositoryTrait for MirrorRepository {
    fn get_revision(&self, key: &EntityKey) -> Result<Option<IdempotencyRecord>> {
        let mut conn = get_connection(&self.pool)?;
        load_revision(&mut conn, key)
    }

    async fn apply_change(&self, change: MappedChange, revision: Revision) -> Result<ApplyResult> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<ApplyResult> {
                apply_change_tx(conn, change, revision)
            })
            .await
    }

    fn get_row(&self, key: &EntityKey) -> Result<Option<InternalRow>> {
        self.get_row_impl(key)
    }
}
