//! Queries over the `sessions` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Session, SessionStatus};

/// Insert a new session row with status `active`.
pub async fn insert_session(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    graph_ref: &str,
    budget_usd: Option<f64>,
    base_branch: &str,
) -> Result<Session> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sessions (id, name, graph_ref, status, cost_usd, planning_cost_usd, \
         budget_usd, base_branch, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 0, 0, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(name)
    .bind(graph_ref)
    .bind(SessionStatus::Active)
    .bind(budget_usd)
    .bind(base_branch)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert session")?;

    get_session(pool, id)
        .await?
        .context("session vanished immediately after insert")
}

/// Fetch a session by id.
pub async fn get_session(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch session")?;
    Ok(session)
}

/// List all sessions, most recently created first.
pub async fn list_sessions(pool: &SqlitePool) -> Result<Vec<Session>> {
    let sessions =
        sqlx::query_as::<_, Session>("SELECT * FROM sessions ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list sessions")?;
    Ok(sessions)
}

/// Unconditionally set a session's status.
pub async fn set_session_status(
    pool: &SqlitePool,
    session_id: &str,
    status: SessionStatus,
) -> Result<()> {
    sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(session_id)
        .execute(pool)
        .await
        .context("failed to update session status")?;
    Ok(())
}

/// Add `delta` to the session's cumulative cost, optionally routing it to
/// the planning-cost column instead of the main cost column.
pub async fn accrue_session_cost(
    pool: &SqlitePool,
    session_id: &str,
    delta_usd: f64,
    is_planning: bool,
) -> Result<()> {
    let column = if is_planning {
        "planning_cost_usd"
    } else {
        "cost_usd"
    };
    let stmt = format!("UPDATE sessions SET {column} = {column} + ?, updated_at = ? WHERE id = ?");
    sqlx::query(&stmt)
        .bind(delta_usd)
        .bind(Utc::now())
        .bind(session_id)
        .execute(pool)
        .await
        .context("failed to accrue session cost")?;
    Ok(())
}

/// The most recently updated session still in status `interrupted`.
///
/// Used by a `resume` driver to find the session to continue.
pub async fn find_interrupted_session(pool: &SqlitePool) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE status = ? ORDER BY updated_at DESC LIMIT 1",
    )
    .bind(SessionStatus::Interrupted)
    .fetch_optional(pool)
    .await
    .context("failed to query interrupted sessions")?;
    Ok(session)
}

/// Mark a session `abandoned`. Idempotent; abandoned sessions are never
/// re-entered.
pub async fn archive_session(pool: &SqlitePool, session_id: &str) -> Result<()> {
    set_session_status(pool, session_id, SessionStatus::Abandoned).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_test_utils::temp_store;

    #[tokio::test]
    async fn insert_and_fetch_round_trips() {
        let store = temp_store().await;
        let session = insert_session(&store.pool, "s1", "demo", "graph.yaml", Some(5.0), "main")
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.budget_usd, Some(5.0));

        let fetched = get_session(&store.pool, "s1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "s1");
    }

    #[tokio::test]
    async fn accrue_cost_separates_planning_column() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "graph.yaml", None, "main")
            .await
            .unwrap();

        accrue_session_cost(&store.pool, "s1", 0.5, false).await.unwrap();
        accrue_session_cost(&store.pool, "s1", 0.25, true).await.unwrap();

        let session = get_session(&store.pool, "s1").await.unwrap().unwrap();
        assert_eq!(session.cost_usd, 0.5);
        assert_eq!(session.planning_cost_usd, 0.25);
    }

    #[tokio::test]
    async fn find_interrupted_returns_most_recent() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "a", "g", None, "main").await.unwrap();
        insert_session(&store.pool, "s2", "b", "g", None, "main").await.unwrap();
        set_session_status(&store.pool, "s1", SessionStatus::Interrupted).await.unwrap();
        set_session_status(&store.pool, "s2", SessionStatus::Interrupted).await.unwrap();

        let found = find_interrupted_session(&store.pool).await.unwrap().unwrap();
        assert_eq!(found.id, "s2");
    }

    #[tokio::test]
    async fn archive_sets_abandoned() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "a", "g", None, "main").await.unwrap();
        archive_session(&store.pool, "s1").await.unwrap();
        let session = get_session(&store.pool, "s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Abandoned);
    }
}
