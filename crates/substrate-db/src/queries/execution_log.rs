//! Queries over the append-only `execution_log` audit trail.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::models::ExecutionLogEntry;

/// Parameters for appending a new log entry.
pub struct NewLogEntry<'a> {
    pub task_id: Option<&'a str>,
    pub event_kind: &'a str,
    pub old_status: Option<&'a str>,
    pub new_status: Option<&'a str>,
    pub agent: Option<&'a str>,
    pub cost_delta_usd: Option<f64>,
    pub data: Option<Value>,
}

/// Append one entry to the session's execution log. Never updated or
/// deleted once written.
pub async fn append_log_entry(
    pool: &SqlitePool,
    session_id: &str,
    entry: &NewLogEntry<'_>,
) -> Result<ExecutionLogEntry> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO execution_log (session_id, task_id, event_kind, old_status, new_status, \
         agent, cost_delta_usd, data, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(entry.task_id)
    .bind(entry.event_kind)
    .bind(entry.old_status)
    .bind(entry.new_status)
    .bind(entry.agent)
    .bind(entry.cost_delta_usd)
    .bind(entry.data.as_ref())
    .bind(now)
    .execute(pool)
    .await
    .context("failed to append execution log entry")?
    .last_insert_rowid();

    let row = sqlx::query_as::<_, ExecutionLogEntry>("SELECT * FROM execution_log WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("log entry vanished immediately after insert")?;

    Ok(row)
}

/// The full log for a session, oldest first.
pub async fn list_log_for_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<ExecutionLogEntry>> {
    let entries = sqlx::query_as::<_, ExecutionLogEntry>(
        "SELECT * FROM execution_log WHERE session_id = ? ORDER BY recorded_at ASC, id ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("failed to list execution log for session")?;
    Ok(entries)
}

/// The log entries touching one task, oldest first.
pub async fn list_log_for_task(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
) -> Result<Vec<ExecutionLogEntry>> {
    let entries = sqlx::query_as::<_, ExecutionLogEntry>(
        "SELECT * FROM execution_log WHERE session_id = ? AND task_id = ? \
         ORDER BY recorded_at ASC, id ASC",
    )
    .bind(session_id)
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list execution log for task")?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::sessions::insert_session;
    use substrate_test_utils::temp_store;

    #[tokio::test]
    async fn append_and_list_preserve_order() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();

        append_log_entry(
            &store.pool,
            "s1",
            &NewLogEntry {
                task_id: Some("a"),
                event_kind: "task:started",
                old_status: Some("pending"),
                new_status: Some("running"),
                agent: Some("claude-code"),
                cost_delta_usd: None,
                data: None,
            },
        )
        .await
        .unwrap();

        append_log_entry(
            &store.pool,
            "s1",
            &NewLogEntry {
                task_id: Some("a"),
                event_kind: "task:completed",
                old_status: Some("running"),
                new_status: Some("completed"),
                agent: Some("claude-code"),
                cost_delta_usd: Some(0.42),
                data: Some(serde_json::json!({"tokens": 1000})),
            },
        )
        .await
        .unwrap();

        let log = list_log_for_task(&store.pool, "s1", "a").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event_kind, "task:started");
        assert_eq!(log[1].cost_delta_usd, Some(0.42));
    }
}
