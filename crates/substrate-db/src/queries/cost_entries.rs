//! Queries over the append-only `cost_entries` ledger.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{BillingMode, CostEntry};

/// Parameters for recording a new cost ledger entry.
pub struct NewCostEntry<'a> {
    pub task_id: Option<&'a str>,
    pub agent: &'a str,
    pub billing_mode: BillingMode,
    pub estimated_cost_usd: f64,
    pub actual_cost_usd: Option<f64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Insert a cost entry. Entries are never updated after insertion; a later
/// actual cost is recorded as a new row via [`record_actual_cost`].
pub async fn insert_cost_entry(
    pool: &SqlitePool,
    session_id: &str,
    entry: &NewCostEntry<'_>,
) -> Result<CostEntry> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO cost_entries (session_id, task_id, agent, billing_mode, \
         estimated_cost_usd, actual_cost_usd, input_tokens, output_tokens, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(entry.task_id)
    .bind(entry.agent)
    .bind(entry.billing_mode)
    .bind(entry.estimated_cost_usd)
    .bind(entry.actual_cost_usd)
    .bind(entry.input_tokens)
    .bind(entry.output_tokens)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert cost entry")?
    .last_insert_rowid();

    let row = sqlx::query_as::<_, CostEntry>("SELECT * FROM cost_entries WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("cost entry vanished immediately after insert")?;

    Ok(row)
}

/// Backfill the actual cost on an existing entry once the adapter reports
/// real usage (e.g. after an async billing callback).
pub async fn record_actual_cost(pool: &SqlitePool, entry_id: i64, actual_cost_usd: f64) -> Result<()> {
    sqlx::query("UPDATE cost_entries SET actual_cost_usd = ? WHERE id = ?")
        .bind(actual_cost_usd)
        .bind(entry_id)
        .execute(pool)
        .await
        .context("failed to record actual cost")?;
    Ok(())
}

/// All cost entries for a session, oldest first.
pub async fn list_entries_for_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<CostEntry>> {
    let entries = sqlx::query_as::<_, CostEntry>(
        "SELECT * FROM cost_entries WHERE session_id = ? ORDER BY recorded_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("failed to list cost entries for session")?;
    Ok(entries)
}

/// All cost entries for one task within a session, oldest first.
pub async fn list_entries_for_task(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
) -> Result<Vec<CostEntry>> {
    let entries = sqlx::query_as::<_, CostEntry>(
        "SELECT * FROM cost_entries WHERE session_id = ? AND task_id = ? ORDER BY recorded_at ASC",
    )
    .bind(session_id)
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list cost entries for task")?;
    Ok(entries)
}

/// Sum of effective cost (actual when known, else estimated) across all
/// entries for a session. Used by the budget enforcer to compare against
/// `sessions.budget_usd`.
pub async fn sum_effective_cost(pool: &SqlitePool, session_id: &str) -> Result<f64> {
    let entries = list_entries_for_session(pool, session_id).await?;
    Ok(entries.iter().map(CostEntry::effective_cost_usd).sum())
}

/// Sum of effective cost (actual when known, else estimated) across all
/// entries for one task. Used by the budget enforcer to compare against
/// `tasks.budget_usd`, since `tasks.cost_usd` is only updated on
/// completion and would miss a single attempt that blows its cap.
pub async fn sum_effective_cost_for_task(pool: &SqlitePool, session_id: &str, task_id: &str) -> Result<f64> {
    let entries = list_entries_for_task(pool, session_id, task_id).await?;
    Ok(entries.iter().map(CostEntry::effective_cost_usd).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::sessions::insert_session;
    use substrate_test_utils::temp_store;

    fn entry(task_id: Option<&str>, estimated: f64, actual: Option<f64>) -> NewCostEntry<'_> {
        NewCostEntry {
            task_id,
            agent: "claude-code",
            billing_mode: BillingMode::Api,
            estimated_cost_usd: estimated,
            actual_cost_usd: actual,
            input_tokens: 100,
            output_tokens: 50,
        }
    }

    #[tokio::test]
    async fn insert_and_list_round_trips() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();

        insert_cost_entry(&store.pool, "s1", &entry(Some("a"), 1.0, None)).await.unwrap();
        insert_cost_entry(&store.pool, "s1", &entry(Some("a"), 0.5, Some(0.4))).await.unwrap();

        let entries = list_entries_for_task(&store.pool, "s1", "a").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn sum_effective_cost_prefers_actual() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();

        insert_cost_entry(&store.pool, "s1", &entry(Some("a"), 1.0, None)).await.unwrap();
        insert_cost_entry(&store.pool, "s1", &entry(Some("b"), 2.0, Some(1.5))).await.unwrap();

        let total = sum_effective_cost(&store.pool, "s1").await.unwrap();
        assert!((total - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sum_effective_cost_for_task_ignores_other_tasks() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();

        insert_cost_entry(&store.pool, "s1", &entry(Some("a"), 1.0, Some(0.9))).await.unwrap();
        insert_cost_entry(&store.pool, "s1", &entry(Some("a"), 0.5, None)).await.unwrap();
        insert_cost_entry(&store.pool, "s1", &entry(Some("b"), 10.0, None)).await.unwrap();

        let total = sum_effective_cost_for_task(&store.pool, "s1", "a").await.unwrap();
        assert!((total - 1.4).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn record_actual_cost_updates_existing_entry() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();
        let inserted = insert_cost_entry(&store.pool, "s1", &entry(None, 3.0, None)).await.unwrap();

        record_actual_cost(&store.pool, inserted.id, 2.75).await.unwrap();

        let entries = list_entries_for_session(&store.pool, "s1").await.unwrap();
        assert_eq!(entries[0].actual_cost_usd, Some(2.75));
    }
}
