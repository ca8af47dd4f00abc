use std::sync::Arc;
use tempfile::tempdir;

use crate::db::write_actor::spawn_writer;
use crate::db::{create_pool, init, run_migrations, DbPool, WriteHandle};

/// Fresh migrated database in its own temp directory.
pub(crate) fn setup_db() -> (Arc<DbPool>, WriteHandle) {
    let app_data = tempdir()
        .expect("tempdir")
        .keep()
        .to_string_lossy()
        .to_string();
    let db_path = init(&app_data).expect("init db");
    run_migrations(&db_path).expect("migrate db");
    let pool = create_pool(&db_path).expect("create pool");
    let writer = spawn_writer(pool.as_ref().clone());
    (pool, writer)
}
