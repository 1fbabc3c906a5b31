//! Database query functions for the `tasks` and `task_dependencies` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Task, TaskStatus};

/// A task definition to insert, prior to persistence.
pub struct NewTask<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub prompt: &'a str,
    pub task_type: &'a str,
    pub agent: Option<&'a str>,
    pub model: Option<&'a str>,
    pub budget_usd: Option<f64>,
    pub max_retries: i64,
}

/// Insert a new task row with initial status `pending`.
pub async fn insert_task(pool: &SqlitePool, session_id: &str, task: &NewTask<'_>) -> Result<Task> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO tasks (session_id, id, name, prompt, task_type, status, agent, model, \
         retry_count, max_retries, budget_usd, cost_usd, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 0, ?, ?)",
    )
    .bind(session_id)
    .bind(task.id)
    .bind(task.name)
    .bind(task.prompt)
    .bind(task.task_type)
    .bind(TaskStatus::Pending)
    .bind(task.agent)
    .bind(task.model)
    .bind(task.max_retries)
    .bind(task.budget_usd)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert task")?;

    get_task(pool, session_id, task.id)
        .await?
        .context("task vanished immediately after insert")
}

/// Fetch a single task by session + id.
pub async fn get_task(pool: &SqlitePool, session_id: &str, task_id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE session_id = ? AND id = ?")
        .bind(session_id)
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a session, ordered by creation time.
pub async fn list_tasks_for_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE session_id = ? ORDER BY created_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for session")?;

    Ok(tasks)
}

/// Insert a dependency edge: `task_id` depends on `depends_on`.
///
/// Uses `INSERT OR IGNORE` so this is idempotent.
pub async fn insert_task_dependency(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
    depends_on: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO task_dependencies (session_id, task_id, depends_on) \
         VALUES (?, ?, ?)",
    )
    .bind(session_id)
    .bind(task_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the ids of all tasks that a given task depends on.
pub async fn get_task_dependencies(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT depends_on FROM task_dependencies WHERE session_id = ? AND task_id = ?",
    )
    .bind(session_id)
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Count total dependency edges for a session.
pub async fn count_dependency_edges(pool: &SqlitePool, session_id: &str) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM task_dependencies WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(pool)
            .await
            .context("failed to count dependency edges")?;

    Ok(row.0)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes `status =
/// from`, so the row is only updated if the current status matches the
/// expected value. Returns the number of rows affected (0 means the
/// precondition did not hold).
#[allow(clippy::too_many_arguments)]
pub async fn transition_task_status(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    worker_id: Option<&str>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, \
             worker_id = COALESCE(?, worker_id), \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at), \
             updated_at = ? \
         WHERE session_id = ? AND id = ? AND status = ?",
    )
    .bind(to)
    .bind(worker_id)
    .bind(started_at)
    .bind(completed_at)
    .bind(Utc::now())
    .bind(session_id)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Record a terminal `completed` transition, writing output and cost in the
/// same statement as the status change.
pub async fn complete_task(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
    output: &str,
    cost_usd: f64,
) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, output = ?, cost_usd = cost_usd + ?, completed_at = ?, updated_at = ? \
         WHERE session_id = ? AND id = ? AND status = ?",
    )
    .bind(TaskStatus::Completed)
    .bind(output)
    .bind(cost_usd)
    .bind(now)
    .bind(now)
    .bind(session_id)
    .bind(task_id)
    .bind(TaskStatus::Running)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Record a terminal `failed` transition.
pub async fn fail_task(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
    error: &str,
) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, error = ?, completed_at = ?, updated_at = ? \
         WHERE session_id = ? AND id = ? AND status = ?",
    )
    .bind(TaskStatus::Failed)
    .bind(error)
    .bind(now)
    .bind(now)
    .bind(session_id)
    .bind(task_id)
    .bind(TaskStatus::Running)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(result.rows_affected())
}

/// Transition `running -> pending` for a retry, incrementing the retry
/// counter and clearing worker/worktree metadata. Optimistic lock on both
/// status and the current retry count.
pub async fn retry_task_to_pending(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
    current_retry_count: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, retry_count = retry_count + 1, worker_id = NULL, \
             worktree_path = NULL, branch = NULL, started_at = NULL, \
             completed_at = NULL, updated_at = ? \
         WHERE session_id = ? AND id = ? AND status = ? AND retry_count = ?",
    )
    .bind(TaskStatus::Pending)
    .bind(Utc::now())
    .bind(session_id)
    .bind(task_id)
    .bind(TaskStatus::Running)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to retry task to pending")?;

    Ok(result.rows_affected())
}

/// Set the worktree path and branch on a task (called once the worktree
/// manager has provisioned them).
pub async fn set_worktree(
    pool: &SqlitePool,
    session_id: &str,
    task_id: &str,
    worktree_path: &str,
    branch: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET worktree_path = ?, branch = ?, updated_at = ? \
         WHERE session_id = ? AND id = ?",
    )
    .bind(worktree_path)
    .bind(branch)
    .bind(Utc::now())
    .bind(session_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task worktree")?;

    Ok(result.rows_affected())
}

/// Stamp `worktree_cleaned_at` on a task.
pub async fn mark_worktree_cleaned(pool: &SqlitePool, session_id: &str, task_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET worktree_cleaned_at = ?, updated_at = ? \
         WHERE session_id = ? AND id = ?",
    )
    .bind(Utc::now())
    .bind(Utc::now())
    .bind(session_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark worktree cleaned")?;

    Ok(())
}

/// Get all tasks in a session whose own status is `pending` and whose
/// dependencies are all `completed` — the ready-tasks view.
pub async fn get_ready_tasks(pool: &SqlitePool, session_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         INNER JOIN ready_tasks rt ON rt.session_id = t.session_id AND rt.id = t.id \
         WHERE t.session_id = ? \
         ORDER BY t.created_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("failed to get ready tasks")?;

    Ok(tasks)
}

/// Status counts for a session's tasks.
#[derive(Debug, Clone, Default)]
pub struct SessionProgress {
    pub pending: i64,
    pub ready: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given session.
pub async fn get_session_progress(pool: &SqlitePool, session_id: &str) -> Result<SessionProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) as cnt FROM tasks WHERE session_id = ? GROUP BY status",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("failed to get session progress")?;

    let mut progress = SessionProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "ready" => progress.ready = *count,
            "running" => progress.running = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "cancelled" => progress.cancelled = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Whether every task in the session has reached a terminal status and the
/// ready/running sets are both empty (the definition of `graph:complete`).
pub async fn is_session_drained(pool: &SqlitePool, session_id: &str) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE session_id = ? AND status IN ('pending', 'ready', 'running')",
    )
    .bind(session_id)
    .fetch_one(pool)
    .await
    .context("failed to check session drain state")?;

    Ok(row.0 == 0)
}

/// Reset tasks stuck in `running` back to `pending` (retry budget intact)
/// or `failed` (exhausted), as part of crash recovery. Returns the ids of
/// tasks that were retried and the ids that were terminally failed.
pub async fn reset_orphaned_tasks(pool: &SqlitePool, session_id: &str) -> Result<(Vec<String>, Vec<String>)> {
    let running = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE session_id = ? AND status = ?",
    )
    .bind(session_id)
    .bind(TaskStatus::Running)
    .fetch_all(pool)
    .await
    .context("failed to list orphaned tasks")?;

    let mut retried = Vec::new();
    let mut failed = Vec::new();
    let now = Utc::now();

    for task in running {
        if task.retry_count < task.max_retries {
            let affected = sqlx::query(
                "UPDATE tasks SET status = ?, retry_count = retry_count + 1, worker_id = NULL, \
                 updated_at = ? WHERE session_id = ? AND id = ? AND status = ?",
            )
            .bind(TaskStatus::Pending)
            .bind(now)
            .bind(session_id)
            .bind(&task.id)
            .bind(TaskStatus::Running)
            .execute(pool)
            .await
            .context("failed to recover orphaned task to pending")?
            .rows_affected();
            if affected > 0 {
                retried.push(task.id);
            }
        } else {
            let affected = sqlx::query(
                "UPDATE tasks SET status = ?, error = ?, completed_at = ?, updated_at = ? \
                 WHERE session_id = ? AND id = ? AND status = ?",
            )
            .bind(TaskStatus::Failed)
            .bind("Process crashed and max retries exceeded")
            .bind(now)
            .bind(now)
            .bind(session_id)
            .bind(&task.id)
            .bind(TaskStatus::Running)
            .execute(pool)
            .await
            .context("failed to recover orphaned task to failed")?
            .rows_affected();
            if affected > 0 {
                failed.push(task.id);
            }
        }
    }

    Ok((retried, failed))
}

/// Mark every non-terminal task in a session `cancelled`.
pub async fn cancel_all_non_terminal(pool: &SqlitePool, session_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "UPDATE tasks SET status = ?, completed_at = ?, updated_at = ? \
         WHERE session_id = ? AND status IN ('pending', 'ready', 'running') \
         RETURNING id",
    )
    .bind(TaskStatus::Cancelled)
    .bind(Utc::now())
    .bind(Utc::now())
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("failed to cancel non-terminal tasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::sessions::insert_session;
    use substrate_test_utils::temp_store;

    fn task(id: &str) -> NewTask<'_> {
        NewTask {
            id,
            name: id,
            prompt: "do work",
            task_type: "coding",
            agent: None,
            model: None,
            budget_usd: None,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trips() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();
        let t = insert_task(&store.pool, "s1", &task("a")).await.unwrap();
        assert_eq!(t.status, TaskStatus::Pending);

        let fetched = get_task(&store.pool, "s1", "a").await.unwrap().unwrap();
        assert_eq!(fetched.id, "a");
    }

    #[tokio::test]
    async fn ready_tasks_respects_dependencies() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();
        insert_task(&store.pool, "s1", &task("a")).await.unwrap();
        insert_task(&store.pool, "s1", &task("b")).await.unwrap();
        insert_task_dependency(&store.pool, "s1", "b", "a").await.unwrap();

        let ready = get_ready_tasks(&store.pool, "s1").await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "a");

        complete_task(&store.pool, "s1", "a", "ok", 0.0).await.unwrap();
        transition_task_status(
            &store.pool,
            "s1",
            "a",
            TaskStatus::Pending,
            TaskStatus::Running,
            Some("w1"),
            None,
            None,
        )
        .await
        .ok();

        let ready_after = get_ready_tasks(&store.pool, "s1").await.unwrap();
        assert_eq!(ready_after.len(), 1);
        assert_eq!(ready_after[0].id, "b");
    }

    #[tokio::test]
    async fn optimistic_lock_rejects_stale_transition() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();
        insert_task(&store.pool, "s1", &task("a")).await.unwrap();

        let affected = transition_task_status(
            &store.pool,
            "s1",
            "a",
            TaskStatus::Running, // wrong `from`
            TaskStatus::Completed,
            None,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn reset_orphaned_retries_under_cap_and_fails_over_cap() {
        let store = temp_store().await;
        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();
        insert_task(&store.pool, "s1", &task("a")).await.unwrap();
        insert_task(&store.pool, "s1", &task("b")).await.unwrap();

        transition_task_status(&store.pool, "s1", "a", TaskStatus::Pending, TaskStatus::Running, Some("w"), None, None).await.unwrap();
        transition_task_status(&store.pool, "s1", "b", TaskStatus::Pending, TaskStatus::Running, Some("w"), None, None).await.unwrap();

        // Exhaust b's retries directly.
        sqlx::query("UPDATE tasks SET retry_count = max_retries WHERE session_id = 's1' AND id = 'b'")
            .execute(&store.pool)
            .await
            .unwrap();

        let (retried, failed) = reset_orphaned_tasks(&store.pool, "s1").await.unwrap();
        assert_eq!(retried, vec!["a".to_string()]);
        assert_eq!(failed, vec!["b".to_string()]);
    }
}
