//! Queries over the `session_signals` table.
//!
//! Signals are the out-of-band channel by which a `pause`/`resume`/`cancel`
//! request reaches a running orchestrator: a row is inserted by whoever
//! issues the request, and the orchestrator's signal poller consumes
//! (reads then deletes) pending rows on its own cadence.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{SessionSignal, SignalKind};

/// Insert a new signal for the orchestrator to pick up.
pub async fn insert_signal(pool: &SqlitePool, session_id: &str, signal: SignalKind) -> Result<()> {
    sqlx::query("INSERT INTO session_signals (session_id, signal, created_at) VALUES (?, ?, ?)")
        .bind(session_id)
        .bind(signal)
        .bind(Utc::now())
        .execute(pool)
        .await
        .context("failed to insert session signal")?;
    Ok(())
}

/// Atomically fetch and delete every pending signal for a session, in the
/// order they were created. Callers should apply them in order: a `cancel`
/// after a `pause` in the same batch still wins.
pub async fn drain_signals(pool: &SqlitePool, session_id: &str) -> Result<Vec<SessionSignal>> {
    let mut tx = pool.begin().await.context("failed to start signal drain transaction")?;

    let signals = sqlx::query_as::<_, SessionSignal>(
        "SELECT * FROM session_signals WHERE session_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(session_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to read pending signals")?;

    if !signals.is_empty() {
        sqlx::query("DELETE FROM session_signals WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear drained signals")?;
    }

    tx.commit().await.context("failed to commit signal drain")?;

    Ok(signals)
}
