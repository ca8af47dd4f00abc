use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;
use std::sync::Arc;

use salla_mirror_core::errors::{DatabaseError, Error, Result};
use salla_mirror_core::sync::{DeadLetter, RetryQueueRepositoryTrait, RetryUnit};

use crate::codec::{
    count_from_db, count_to_db, enum_from_db, enum_to_db, timestamp_from_db, timestamp_to_db,
};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{sync_dead_letters, sync_retry_queue};

#[derive(Queryable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = sync_retry_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RetryUnitDB {
    pub id: String,
    pub store_id: String,
    pub entity_kind: String,
    pub external_id: String,
    pub event: String,
    pub attempts: i32,
    pub next_retry_at: String,
    pub failure_kind: String,
    pub last_error: String,
    pub created_at: String,
}

impl RetryUnitDB {
    fn from_domain(unit: &RetryUnit) -> Result<Self> {
        Ok(Self {
            id: unit.id.clone(),
            store_id: unit.store_id.clone(),
            entity_kind: enum_to_db(&unit.kind)?,
            external_id: unit.external_id.clone(),
            event: serde_json::to_string(&unit.event)?,
            attempts: count_to_db(unit.attempts),
            next_retry_at: timestamp_to_db(unit.next_retry_at),
            failure_kind: enum_to_db(&unit.failure_kind)?,
            last_error: unit.last_error.clone(),
            created_at: unit.created_at.clone(),
        })
    }

    fn into_domain(self) -> Result<RetryUnit> {
        Ok(RetryUnit {
            kind: enum_from_db(&self.entity_kind)?,
            event: serde_json::from_str(&self.event)?,
            attempts: count_from_db(self.attempts, "attempts")?,
            next_retry_at: timestamp_from_db(&self.next_retry_at)?,
            failure_kind: enum_from_db(&self.failure_kind)?,
            id: self.id,
            store_id: self.store_id,
            external_id: self.external_id,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

#[derive(Queryable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = sync_dead_letters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeadLetterDB {
    pub id: String,
    pub store_id: String,
    pub entity_kind: String,
    pub external_id: String,
    pub reason: String,
    pub last_error: String,
    pub attempts: i32,
    pub event: String,
    pub created_at: String,
    pub resubmitted_at: Option<String>,
}

impl DeadLetterDB {
    fn from_domain(letter: &DeadLetter) -> Result<Self> {
        Ok(Self {
            id: letter.id.clone(),
            store_id: letter.store_id.clone(),
            entity_kind: enum_to_db(&letter.kind)?,
            external_id: letter.external_id.clone(),
            reason: enum_to_db(&letter.reason)?,
            last_error: letter.last_error.clone(),
            attempts: count_to_db(letter.attempts),
            event: serde_json::to_string(&letter.event)?,
            created_at: letter.created_at.clone(),
            resubmitted_at: letter.resubmitted_at.clone(),
        })
    }

    fn into_domain(self) -> Result<DeadLetter> {
        Ok(DeadLetter {
            kind: enum_from_db(&self.entity_kind)?,
            reason: enum_from_db(&self.reason)?,
            attempts: count_from_db(self.attempts, "attempts")?,
            event: serde_json::from_str(&self.event)?,
            id: self.id,
            store_id: self.store_id,
            external_id: self.external_id,
            last_error: self.last_error,
            created_at: self.created_at,
            resubmitted_at: self.resubmitted_at,
        })
    }
}

fn upsert_retry_tx(conn: &mut SqliteConnection, row: &RetryUnitDB) -> Result<()> {
    diesel::insert_into(sync_retry_queue::table)
        .values(row)
        .on_conflict(sync_retry_queue::id)
        .do_update()
        .set(row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

pub struct RetryQueueRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl RetryQueueRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    /// Number of units waiting for another attempt.
    pub fn pending_count(&self, store_id: &str) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        Ok(sync_retry_queue::table
            .filter(sync_retry_queue::store_id.eq(store_id))
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?)
    }
}

#[async_trait]
impl RetryQueueRepositoryTrait for RetryQueueRepository {
    async fn upsert_retry(&self, unit: RetryUnit) -> Result<()> {
        let row = RetryUnitDB::from_domain(&unit)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> { upsert_retry_tx(conn, &row) })
            .await
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_secs: i64,
    ) -> Result<Vec<RetryUnit>> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<Vec<RetryUnit>> {
                let due = sync_retry_queue::table
                    .filter(sync_retry_queue::next_retry_at.le(timestamp_to_db(now)))
                    .order((sync_retry_queue::next_retry_at.asc(), sync_retry_queue::id.asc()))
                    .limit(limit.max(0))
                    .load::<RetryUnitDB>(conn)
                    .map_err(StorageError::from)?;
                if due.is_empty() {
                    return Ok(Vec::new());
                }

                let ids: Vec<String> = due.iter().map(|row| row.id.clone()).collect();
                let leased_until = timestamp_to_db(now + Duration::seconds(lease_secs.max(0)));
                diesel::update(sync_retry_queue::table.filter(sync_retry_queue::id.eq_any(&ids)))
                    .set(sync_retry_queue::next_retry_at.eq(leased_until))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                debug!("[Storage] Claimed {} due retry units", ids.len());

                due.into_iter().map(RetryUnitDB::into_domain).collect()
            })
            .await
    }

    async fn remove_retry(&self, retry_id: &str) -> Result<()> {
        let retry_id = retry_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::delete(sync_retry_queue::table.find(&retry_id))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn move_to_dead_letter(
        &self,
        retry_id: Option<String>,
        letter: DeadLetter,
    ) -> Result<()> {
        let row = DeadLetterDB::from_domain(&letter)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                if let Some(retry_id) = retry_id {
                    diesel::delete(sync_retry_queue::table.find(&retry_id))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }
                diesel::insert_into(sync_dead_letters::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    fn list_dead_letters(&self, store_id: &str, limit: i64) -> Result<Vec<DeadLetter>> {
        let mut conn = get_connection(&self.pool)?;
        sync_dead_letters::table
            .filter(sync_dead_letters::store_id.eq(store_id))
            .order((sync_dead_letters::created_at.desc(), sync_dead_letters::id.desc()))
            .limit(limit.max(0))
            .load::<DeadLetterDB>(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(DeadLetterDB::into_domain)
            .collect()
    }

    fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        let mut conn = get_connection(&self.pool)?;
        sync_dead_letters::table
            .find(id)
            .first::<DeadLetterDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(DeadLetterDB::into_domain)
            .transpose()
    }

    async fn resubmit_dead_letter(&self, id: &str, unit: RetryUnit) -> Result<DeadLetter> {
        let id = id.to_string();
        let retry_row = RetryUnitDB::from_domain(&unit)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<DeadLetter> {
                let updated = diesel::update(sync_dead_letters::table.find(&id))
                    .set(sync_dead_letters::resubmitted_at.eq(Some(timestamp_to_db(Utc::now()))))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if updated == 0 {
                    return Err(Error::Database(DatabaseError::NotFound(format!(
                        "dead letter '{}'",
                        id
                    ))));
                }
                upsert_retry_tx(conn, &retry_row)?;
                sync_dead_letters::table
                    .find(&id)
                    .first::<DeadLetterDB>(conn)
                    .map_err(StorageError::from)?
                    .into_domain()
            })
            .await
    }
}
