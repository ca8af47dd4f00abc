//! SQLite storage for the Salla mirror.
//!
//! Reads go through the r2d2 pool; every write goes through the single writer
//! actor in [`db::write_actor`], which wraps each job in one immediate
//! transaction. The mirror tables are written by a generic rowset applier, the
//! bookkeeping tables (idempotency, sync logs, checkpoints, retries) through
//! the typed diesel schema.

pub mod db;
pub mod errors;
pub mod mirror;
pub mod retry_queue;
pub mod schema;
pub mod sync_log;

mod codec;
#[cfg(test)]
mod test_support;

pub use db::{
    create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle,
};
pub use errors::StorageError;
pub use mirror::MirrorRepository;
pub use retry_queue::RetryQueueRepository;
pub use sync_log::SyncLogRepository;
