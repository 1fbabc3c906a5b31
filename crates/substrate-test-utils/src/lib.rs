//! Shared test utilities for substrate integration tests.
//!
//! Each test gets its own tempfile-backed SQLite database with migrations
//! already applied, instead of a shared container-backed instance: SQLite
//! is cheap enough per-process that there is no need to pool instances the
//! way the Postgres-backed teacher setup did.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Executor, SqlitePool};
use tempfile::TempDir;

use substrate_db::pool;

/// A throwaway SQLite database for a single test.
///
/// Holds the backing [`TempDir`] alive for the lifetime of the struct; the
/// database file (and its `-wal`/`-shm` siblings) are removed when this
/// value is dropped.
pub struct TempStore {
    pub pool: SqlitePool,
    _dir: TempDir,
}

/// Create a fresh, migrated SQLite database in a temporary directory.
pub async fn temp_store() -> TempStore {
    let dir = TempDir::new().expect("failed to create temp dir for test database");
    let db_path = dir.path().join("state.db");

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&format!("sqlite:{}?mode=rwc", db_path.display()))
        .await
        .expect("failed to open temp sqlite database");

    pool.execute("PRAGMA foreign_keys = ON;")
        .await
        .expect("failed to enable foreign keys in test database");

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed against a fresh database");

    TempStore { pool, _dir: dir }
}
