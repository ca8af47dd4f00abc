//! Serialized writer. SQLite allows one writer at a time, so every mutation
//! is queued here and run on a dedicated thread inside an immediate
//! transaction.

use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use salla_mirror_core::errors::{Error, Result};

use super::{DbConnection, DbPool};
use crate::errors::StorageError;

type WriteJob = Box<dyn FnOnce(Result<&mut SqliteConnection>) + Send + 'static>;

/// Carries either a rollback-triggering diesel error or an engine error out of
/// the transaction closure.
enum TxError {
    Diesel(diesel::result::Error),
    Engine(Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Diesel(err)
    }
}

impl From<TxError> for Error {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Diesel(err) => StorageError::from(err).into(),
            TxError::Engine(err) => err,
        }
    }
}

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriteHandle {
    /// Runs `job` in its own transaction on the writer thread. An `Err` from the
    /// job rolls the transaction back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: WriteJob = Box::new(move |conn: Result<&mut SqliteConnection>| {
            let result = conn.and_then(|conn| {
                conn.immediate_transaction::<T, TxError, _>(|tx_conn| {
                    job(tx_conn).map_err(TxError::Engine)
                })
                .map_err(Error::from)
            });
            let _ = reply_tx.send(result);
        });
        self.tx
            .send(wrapped)
            .map_err(|_| Error::internal("database writer has stopped"))?;
        reply_rx
            .await
            .map_err(|_| Error::internal("database writer dropped the job"))?
    }
}

/// Starts the writer thread. It holds one pooled connection and re-acquires it
/// after a checkout failure.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
    std::thread::spawn(move || {
        let mut conn: Option<DbConnection> = None;
        while let Some(job) = rx.blocking_recv() {
            if conn.is_none() {
                match pool.get() {
                    Ok(acquired) => conn = Some(acquired),
                    Err(err) => {
                        error!("[Storage] Writer could not acquire a connection: {}", err);
                        job(Err(StorageError::from(err).into()));
                        continue;
                    }
                }
            }
            if let Some(conn) = conn.as_mut() {
                job(Ok(&mut **conn));
            }
        }
        debug!("[Storage] Writer stopped");
    });
    WriteHandle { tx }
}
