//! Crash Recovery: run once at startup before accepting new work. Resets
//! orphaned `running` tasks, reclaims stale worktrees, and exposes the
//! lookups the `resume` driver needs to find and archive interrupted
//! sessions.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use substrate_db::queries::{sessions, tasks};
use substrate_db::Session;

use crate::worktree::WorktreeManager;

pub struct RecoverySummary {
    pub retried_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    pub worktrees_reclaimed: usize,
}

pub struct RecoveryManager {
    pool: SqlitePool,
    worktrees: WorktreeManager,
}

impl RecoveryManager {
    pub fn new(pool: SqlitePool, worktrees: WorktreeManager) -> Self {
        Self { pool, worktrees }
    }

    /// Reset every `running` task in `session_id` to `pending` (if retries
    /// remain) or terminal `failed`, then reclaim any worktree directory not
    /// backing a still-live task. Recovery itself emits nothing -- it is
    /// silent by design, the work it undoes never having been observed by a
    /// live orchestrator.
    pub async fn recover_session(&self, session_id: &str) -> Result<RecoverySummary> {
        let (retried, failed) = tasks::reset_orphaned_tasks(&self.pool, session_id).await?;

        let progress = tasks::get_session_progress(&self.pool, session_id).await?;
        let _ = progress; // recomputed post-reset ready set is handled by the caller restarting execution

        let live_task_ids: Vec<String> = tasks::list_tasks_for_session(&self.pool, session_id)
            .await?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();

        let reclaimed = self.worktrees.cleanup_all_worktrees(&live_task_ids);

        info!(
            session_id,
            retried = retried.len(),
            failed = failed.len(),
            worktrees_reclaimed = reclaimed,
            "crash recovery complete"
        );

        Ok(RecoverySummary { retried_task_ids: retried, failed_task_ids: failed, worktrees_reclaimed: reclaimed })
    }

    /// The most recently updated session still `interrupted`, used by a
    /// `resume` driver to find the session to continue.
    pub async fn find_interrupted_session(&self) -> Result<Option<Session>> {
        sessions::find_interrupted_session(&self.pool).await
    }

    /// Mark a session `abandoned`: retained for history, never re-entered.
    pub async fn archive_session(&self, session_id: &str) -> Result<()> {
        sessions::archive_session(&self.pool, session_id).await
    }
}
