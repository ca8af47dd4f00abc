//! Sync log, watermarks and pull checkpoints.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;
use uuid::Uuid;

use salla_mirror_core::entities::EntityKind;
use salla_mirror_core::errors::{DatabaseError, Error, Result};
use salla_mirror_core::sync::{
    NewSyncLog, PullCheckpoint, PullCheckpointRepositoryTrait, PullCompletion, SyncLogEntry,
    SyncLogError, SyncLogRepositoryTrait, SyncProgress, SyncStatus, SyncWindow,
};

use crate::codec::{
    count_from_db, count_to_db, enum_from_db, enum_to_db, timestamp_from_db, timestamp_to_db,
};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{sync_logs, sync_pull_checkpoints, sync_watermarks};

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = sync_logs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncLogDB {
    pub id: String,
    pub store_id: String,
    pub sync_type: String,
    pub entity_kind: Option<String>,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub records_processed: i64,
    pub records_success: i64,
    pub records_failed: i64,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub window_start: Option<String>,
}

impl SyncLogDB {
    fn into_domain(self) -> Result<SyncLogEntry> {
        Ok(SyncLogEntry {
            id: self.id,
            store_id: self.store_id,
            sync_type: enum_from_db(&self.sync_type)?,
            entity_kind: self
                .entity_kind
                .as_deref()
                .map(enum_from_db)
                .transpose()?,
            status: enum_from_db(&self.status)?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            records_processed: self.records_processed,
            records_success: self.records_success,
            records_failed: self.records_failed,
            error_message: self.error_message,
            error_details: self
                .error_details
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            window_start: self.window_start,
        })
    }
}

#[derive(Queryable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = sync_pull_checkpoints)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PullCheckpointDB {
    pub store_id: String,
    pub entity_kind: String,
    pub sync_type: String,
    pub next_page: i32,
    pub log_id: String,
    pub since: Option<String>,
    pub crawl_started_at: String,
    pub updated_at: String,
}

impl PullCheckpointDB {
    fn from_domain(checkpoint: &PullCheckpoint) -> Result<Self> {
        Ok(Self {
            store_id: checkpoint.store_id.clone(),
            entity_kind: enum_to_db(&checkpoint.kind)?,
            sync_type: enum_to_db(&checkpoint.sync_type)?,
            next_page: count_to_db(checkpoint.next_page),
            log_id: checkpoint.log_id.clone(),
            since: checkpoint.since.map(timestamp_to_db),
            crawl_started_at: timestamp_to_db(checkpoint.crawl_started_at),
            updated_at: checkpoint.updated_at.clone(),
        })
    }

    fn into_domain(self) -> Result<PullCheckpoint> {
        Ok(PullCheckpoint {
            kind: enum_from_db(&self.entity_kind)?,
            sync_type: enum_from_db(&self.sync_type)?,
            next_page: count_from_db(self.next_page, "next_page")?,
            since: self.since.as_deref().map(timestamp_from_db).transpose()?,
            crawl_started_at: timestamp_from_db(&self.crawl_started_at)?,
            store_id: self.store_id,
            log_id: self.log_id,
            updated_at: self.updated_at,
        })
    }
}

fn load_log(conn: &mut SqliteConnection, log_id: &str) -> Result<SyncLogDB> {
    sync_logs::table
        .find(log_id)
        .first::<SyncLogDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| Error::Database(DatabaseError::NotFound(format!("sync log '{}'", log_id))))
}

fn complete_tx(
    conn: &mut SqliteConnection,
    log_id: &str,
    status: SyncStatus,
    error: Option<SyncLogError>,
) -> Result<SyncLogEntry> {
    if !status.is_terminal() {
        return Err(Error::InvalidInput(format!(
            "{:?} is not a terminal sync status",
            status
        )));
    }
    load_log(conn, log_id)?;
    let (message, details) = match error {
        Some(error) => (
            Some(error.message),
            error.details.map(|d| d.to_string()),
        ),
        None => (None, None),
    };
    diesel::update(sync_logs::table.find(log_id))
        .set((
            sync_logs::status.eq(enum_to_db(&status)?),
            sync_logs::completed_at.eq(Some(timestamp_to_db(Utc::now()))),
            sync_logs::error_message.eq(message),
            sync_logs::error_details.eq(details),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    load_log(conn, log_id)?.into_domain()
}

pub struct SyncLogRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SyncLogRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl SyncLogRepositoryTrait for SyncLogRepository {
    async fn begin(&self, new_log: NewSyncLog) -> Result<SyncLogEntry> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncLogEntry> {
                let row = SyncLogDB {
                    id: Uuid::new_v4().to_string(),
                    store_id: new_log.store_id,
                    sync_type: enum_to_db(&new_log.sync_type)?,
                    entity_kind: new_log.entity_kind.as_ref().map(enum_to_db).transpose()?,
                    status: enum_to_db(&SyncStatus::Pending)?,
                    started_at: timestamp_to_db(Utc::now()),
                    completed_at: None,
                    records_processed: 0,
                    records_success: 0,
                    records_failed: 0,
                    error_message: None,
                    error_details: None,
                    window_start: None,
                };
                diesel::insert_into(sync_logs::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                row.into_domain()
            })
            .await
    }

    async fn record_progress(&self, log_id: &str, delta: SyncProgress) -> Result<SyncLogEntry> {
        delta.validate()?;
        let log_id = log_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncLogEntry> {
                let current = load_log(conn, &log_id)?;
                let status: SyncStatus = enum_from_db(&current.status)?;
                if status.is_terminal() {
                    return Err(Error::InvalidInput(format!(
                        "sync log '{}' is already {:?}",
                        log_id, status
                    )));
                }
                diesel::update(sync_logs::table.find(&log_id))
                    .set((
                        sync_logs::status.eq(enum_to_db(&SyncStatus::Syncing)?),
                        sync_logs::records_processed
                            .eq(sync_logs::records_processed + delta.processed),
                        sync_logs::records_success.eq(sync_logs::records_success + delta.success),
                        sync_logs::records_failed.eq(sync_logs::records_failed + delta.failed),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                load_log(conn, &log_id)?.into_domain()
            })
            .await
    }

    async fn complete(
        &self,
        log_id: &str,
        status: SyncStatus,
        error: Option<SyncLogError>,
    ) -> Result<SyncLogEntry> {
        let log_id = log_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncLogEntry> {
                complete_tx(conn, &log_id, status, error)
            })
            .await
    }

    async fn complete_pull(&self, log_id: &str, completion: PullCompletion) -> Result<SyncLogEntry> {
        let log_id = log_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncLogEntry> {
                let entry = complete_tx(conn, &log_id, completion.status, completion.error)?;
                let kind_db = enum_to_db(&completion.kind)?;
                let now = timestamp_to_db(Utc::now());
                if completion.status == SyncStatus::Completed {
                    let watermark = timestamp_to_db(completion.watermark);
                    diesel::insert_into(sync_watermarks::table)
                        .values((
                            sync_watermarks::store_id.eq(&completion.store_id),
                            sync_watermarks::entity_kind.eq(&kind_db),
                            sync_watermarks::last_completed_at.eq(&watermark),
                            sync_watermarks::log_id.eq(&log_id),
                            sync_watermarks::updated_at.eq(&now),
                        ))
                        .on_conflict((sync_watermarks::store_id, sync_watermarks::entity_kind))
                        .do_update()
                        .set((
                            sync_watermarks::last_completed_at.eq(&watermark),
                            sync_watermarks::log_id.eq(&log_id),
                            sync_watermarks::updated_at.eq(&now),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }
                diesel::delete(
                    sync_pull_checkpoints::table
                        .filter(sync_pull_checkpoints::store_id.eq(&completion.store_id))
                        .filter(sync_pull_checkpoints::entity_kind.eq(&kind_db)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(entry)
            })
            .await
    }

    async fn record_window_outcome(
        &self,
        window: SyncWindow,
        delta: SyncProgress,
        last_error: Option<String>,
    ) -> Result<()> {
        delta.validate()?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                let sync_type = enum_to_db(&window.sync_type)?;
                let window_start = timestamp_to_db(window.window_start);
                let existing = sync_logs::table
                    .filter(sync_logs::store_id.eq(&window.store_id))
                    .filter(sync_logs::sync_type.eq(&sync_type))
                    .filter(sync_logs::window_start.eq(&window_start))
                    .select(sync_logs::id)
                    .first::<String>(conn)
                    .optional()
                    .map_err(StorageError::from)?;

                let log_id = match existing {
                    Some(id) => id,
                    None => {
                        let row = SyncLogDB {
                            id: Uuid::new_v4().to_string(),
                            store_id: window.store_id.clone(),
                            sync_type,
                            entity_kind: None,
                            status: enum_to_db(&SyncStatus::Syncing)?,
                            started_at: window_start.clone(),
                            completed_at: None,
                            records_processed: 0,
                            records_success: 0,
                            records_failed: 0,
                            error_message: None,
                            error_details: None,
                            window_start: Some(window_start),
                        };
                        diesel::insert_into(sync_logs::table)
                            .values(&row)
                            .execute(conn)
                            .map_err(StorageError::from)?;
                        row.id
                    }
                };

                diesel::update(sync_logs::table.find(&log_id))
                    .set((
                        sync_logs::records_processed
                            .eq(sync_logs::records_processed + delta.processed),
                        sync_logs::records_success.eq(sync_logs::records_success + delta.success),
                        sync_logs::records_failed.eq(sync_logs::records_failed + delta.failed),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if let Some(message) = last_error {
                    diesel::update(sync_logs::table.find(&log_id))
                        .set(sync_logs::error_message.eq(Some(message)))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }
                Ok(())
            })
            .await
    }

    async fn close_windows_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                let open = vec![
                    enum_to_db(&SyncStatus::Pending)?,
                    enum_to_db(&SyncStatus::Syncing)?,
                ];
                let closed = diesel::update(
                    sync_logs::table
                        .filter(sync_logs::window_start.is_not_null())
                        .filter(sync_logs::window_start.lt(timestamp_to_db(cutoff)))
                        .filter(sync_logs::status.eq_any(open)),
                )
                .set((
                    sync_logs::status.eq(enum_to_db(&SyncStatus::Completed)?),
                    sync_logs::completed_at.eq(Some(timestamp_to_db(Utc::now()))),
                ))
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(closed)
            })
            .await
    }

    fn get_log(&self, log_id: &str) -> Result<Option<SyncLogEntry>> {
        let mut conn = get_connection(&self.pool)?;
        sync_logs::table
            .find(log_id)
            .first::<SyncLogDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(SyncLogDB::into_domain)
            .transpose()
    }

    fn list_logs(&self, store_id: &str, limit: i64) -> Result<Vec<SyncLogEntry>> {
        let mut conn = get_connection(&self.pool)?;
        sync_logs::table
            .filter(sync_logs::store_id.eq(store_id))
            .order((sync_logs::started_at.desc(), sync_logs::id.desc()))
            .limit(limit.max(0))
            .load::<SyncLogDB>(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(SyncLogDB::into_domain)
            .collect()
    }

    fn get_watermark(&self, store_id: &str, kind: EntityKind) -> Result<Option<DateTime<Utc>>> {
        let mut conn = get_connection(&self.pool)?;
        sync_watermarks::table
            .filter(sync_watermarks::store_id.eq(store_id))
            .filter(sync_watermarks::entity_kind.eq(enum_to_db(&kind)?))
            .select(sync_watermarks::last_completed_at)
            .first::<String>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .as_deref()
            .map(timestamp_from_db)
            .transpose()
    }
}

#[async_trait]
impl PullCheckpointRepositoryTrait for SyncLogRepository {
    fn get_checkpoint(&self, store_id: &str, kind: EntityKind) -> Result<Option<PullCheckpoint>> {
        let mut conn = get_connection(&self.pool)?;
        sync_pull_checkpoints::table
            .filter(sync_pull_checkpoints::store_id.eq(store_id))
            .filter(sync_pull_checkpoints::entity_kind.eq(enum_to_db(&kind)?))
            .first::<PullCheckpointDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(PullCheckpointDB::into_domain)
            .transpose()
    }

    async fn save_checkpoint(&self, checkpoint: PullCheckpoint) -> Result<()> {
        let row = PullCheckpointDB::from_domain(&checkpoint)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::insert_into(sync_pull_checkpoints::table)
                    .values(&row)
                    .on_conflict((
                        sync_pull_checkpoints::store_id,
                        sync_pull_checkpoints::entity_kind,
                    ))
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn clear_checkpoint(&self, store_id: &str, kind: EntityKind) -> Result<()> {
        let store_id = store_id.to_string();
        let kind_db = enum_to_db(&kind)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::delete(
                    sync_pull_checkpoints::table
                        .filter(sync_pull_checkpoints::store_id.eq(&store_id))
                        .filter(sync_pull_checkpoints::entity_kind.eq(&kind_db)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use chrono::{Duration, TimeZone};
    use salla_mirror_core::sync::SyncType;
    use serde_json::json;

    fn repo() -> SyncLogRepository {
        let (pool, writer) = setup_db();
        SyncLogRepository::new(pool, writer)
    }

    fn new_pull(store_id: &str) -> NewSyncLog {
        NewSyncLog {
            store_id: store_id.to_string(),
            sync_type: SyncType::Full,
            entity_kind: Some(EntityKind::Product),
        }
    }

    #[tokio::test]
    async fn pull_log_lifecycle() {
        let repo = repo();
        let log = repo.begin(new_pull("s1")).await.unwrap();
        assert_eq!(log.status, SyncStatus::Pending);

        repo.record_progress(
            &log.id,
            SyncProgress {
                processed: 3,
                success: 2,
                failed: 1,
            },
        )
        .await
        .unwrap();
        let done = repo
            .complete(
                &log.id,
                SyncStatus::Completed,
                Some(SyncLogError::new("1 of 3 records failed").with_details(json!([{ "externalId": "P3" }]))),
            )
            .await
            .unwrap();

        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!((done.records_processed, done.records_success, done.records_failed), (3, 2, 1));
        assert_eq!(done.error_details, Some(json!([{ "externalId": "P3" }])));
        assert!(done.completed_at.is_some());
        assert_eq!(done.entity_kind, Some(EntityKind::Product));
    }

    #[tokio::test]
    async fn progress_on_closed_log_is_rejected() {
        let repo = repo();
        let log = repo.begin(new_pull("s1")).await.unwrap();
        repo.complete(&log.id, SyncStatus::Failed, None).await.unwrap();
        let err = repo
            .record_progress(&log.id, SyncProgress::applied())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn impossible_progress_is_rejected() {
        let repo = repo();
        let log = repo.begin(new_pull("s1")).await.unwrap();
        let err = repo
            .record_progress(
                &log.id,
                SyncProgress {
                    processed: 1,
                    success: 1,
                    failed: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn completed_pull_advances_watermark_and_clears_checkpoint() {
        let repo = repo();
        let log = repo.begin(new_pull("s1")).await.unwrap();
        let started = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        repo.save_checkpoint(PullCheckpoint {
            store_id: "s1".to_string(),
            kind: EntityKind::Product,
            sync_type: SyncType::Full,
            next_page: 3,
            log_id: log.id.clone(),
            since: None,
            crawl_started_at: started,
            updated_at: timestamp_to_db(started),
        })
        .await
        .unwrap();
        let checkpoint = repo.get_checkpoint("s1", EntityKind::Product).unwrap().unwrap();
        assert_eq!(checkpoint.next_page, 3);
        assert_eq!(checkpoint.crawl_started_at, started);

        repo.complete_pull(
            &log.id,
            PullCompletion {
                store_id: "s1".to_string(),
                kind: EntityKind::Product,
                status: SyncStatus::Completed,
                watermark: started,
                error: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(repo.get_watermark("s1", EntityKind::Product).unwrap(), Some(started));
        assert!(repo.get_checkpoint("s1", EntityKind::Product).unwrap().is_none());
        assert_eq!(repo.get_watermark("s1", EntityKind::Order).unwrap(), None);
    }

    #[tokio::test]
    async fn failed_pull_keeps_previous_watermark() {
        let repo = repo();
        let first = repo.begin(new_pull("s1")).await.unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        let completion = |status, watermark| PullCompletion {
            store_id: "s1".to_string(),
            kind: EntityKind::Product,
            status,
            watermark,
            error: None,
        };
        repo.complete_pull(&first.id, completion(SyncStatus::Completed, t0))
            .await
            .unwrap();
        let second = repo.begin(new_pull("s1")).await.unwrap();
        repo.complete_pull(
            &second.id,
            completion(SyncStatus::Failed, t0 + Duration::hours(1)),
        )
        .await
        .unwrap();

        assert_eq!(repo.get_watermark("s1", EntityKind::Product).unwrap(), Some(t0));
    }

    #[tokio::test]
    async fn window_outcomes_roll_up_into_one_row() {
        let repo = repo();
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 8, 2, 30).unwrap();
        let window = SyncWindow::containing("s1", SyncType::Webhook, at, 300);

        repo.record_window_outcome(window.clone(), SyncProgress::applied(), None)
            .await
            .unwrap();
        repo.record_window_outcome(window.clone(), SyncProgress::skipped(), None)
            .await
            .unwrap();
        repo.record_window_outcome(window, SyncProgress::failed(), Some("s1/order/O1: boom".to_string()))
            .await
            .unwrap();

        let logs = repo.list_logs("s1", 10).unwrap();
        assert_eq!(logs.len(), 1);
        let log = &logs[0];
        assert_eq!(log.sync_type, SyncType::Webhook);
        assert_eq!(log.window_start.as_deref(), Some("2026-04-01T08:00:00.000Z"));
        assert_eq!((log.records_processed, log.records_success, log.records_failed), (3, 1, 1));
        assert_eq!(log.error_message.as_deref(), Some("s1/order/O1: boom"));

        let closed = repo
            .close_windows_before(at + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(closed, 1);
        assert_eq!(repo.list_logs("s1", 10).unwrap()[0].status, SyncStatus::Completed);
        assert_eq!(repo.close_windows_before(at + Duration::minutes(10)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn logs_are_listed_per_store() {
        let repo = repo();
        repo.begin(new_pull("s1")).await.unwrap();
        repo.begin(new_pull("s1")).await.unwrap();
        repo.begin(new_pull("s2")).await.unwrap();
        assert_eq!(repo.list_logs("s1", 10).unwrap().len(), 2);
        assert_eq!(repo.list_logs("s1", 1).unwrap().len(), 1);
        assert_eq!(repo.list_logs("s2", 10).unwrap().len(), 1);
    }
}
