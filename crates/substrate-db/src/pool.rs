use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, SqlitePool};
use tracing::info;

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults for a single-writer,
/// many-reader embedded database.
///
/// `SQLite` serializes writers at the file level, so the pool is capped
/// low; readers are cheap and share the pool's connections via WAL mode.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    if let Some(dir) = config.state_dir() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.connection_url())
        .await
        .with_context(|| {
            format!(
                "failed to open database at {}",
                config.database_path.display()
            )
        })?;

    pool.execute("PRAGMA journal_mode = WAL;")
        .await
        .context("failed to enable WAL mode")?;
    pool.execute("PRAGMA foreign_keys = ON;")
        .await
        .context("failed to enable foreign key enforcement")?;

    Ok(pool)
}

/// Tune synchronous mode separately; exposed for callers that want to trade
/// durability for throughput in tests.
pub async fn set_synchronous(pool: &SqlitePool, mode: SqliteSynchronous) -> Result<()> {
    let pragma = match mode {
        SqliteSynchronous::Off => "OFF",
        SqliteSynchronous::Normal => "NORMAL",
        SqliteSynchronous::Full => "FULL",
        SqliteSynchronous::Extra => "EXTRA",
    };
    pool.execute(format!("PRAGMA synchronous = {pragma};").as_str())
        .await
        .context("failed to set synchronous pragma")?;
    Ok(())
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so that no pre-existing database is required
/// at compile time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &SqlitePool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Checkpoint the write-ahead log into the main database file.
///
/// Called on graceful shutdown so the `.substrate/state.db` file alone is
/// consistent even if the `-wal`/`-shm` siblings are later lost.
pub async fn checkpoint(pool: &SqlitePool) -> Result<()> {
    pool.execute("PRAGMA wal_checkpoint(TRUNCATE);")
        .await
        .context("failed to checkpoint write-ahead log")?;
    Ok(())
}

/// Return the row count for every user-defined table in the database.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlx_%' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `substrate-db`.
///
/// At runtime this resolves relative to the crate's source tree via the
/// `CARGO_MANIFEST_DIR` compile-time env. For installed binaries (where the
/// source tree is absent) the migrations should be embedded at compile time
/// by the caller instead.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
