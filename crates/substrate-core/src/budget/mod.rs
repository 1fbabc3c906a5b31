//! Budget Enforcer: compares accumulated cost against per-task and
//! per-session caps and emits warning/exceedance events. Holds no state of
//! its own -- every check re-reads the durable store.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::warn;

use substrate_db::queries::{cost_entries, sessions, tasks};

use crate::events::{BudgetExceededTask, BudgetWarningTask, Event, EventBus, SessionBudgetExceeded};

const DEFAULT_WARNING_THRESHOLD_PCT: f64 = 80.0;

/// Outcome of a budget check: whether the caller should let the task/session
/// continue or terminate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Continue,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Percentage of a cap at which a warning event fires, short of
    /// exceedance. Caps of zero are treated as unlimited and never warn or
    /// exceed.
    pub warning_threshold_pct: f64,
    /// When false (the default), the cost a session spent before execution
    /// began (graph loading, routing estimates) is excluded from the total
    /// compared against the session cap.
    pub planning_cost_counts_against_budget: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warning_threshold_pct: DEFAULT_WARNING_THRESHOLD_PCT,
            planning_cost_counts_against_budget: false,
        }
    }
}

pub struct BudgetEnforcer {
    pool: SqlitePool,
    events: EventBus,
    config: BudgetConfig,
}

impl BudgetEnforcer {
    pub fn new(pool: SqlitePool, events: EventBus, config: BudgetConfig) -> Self {
        Self { pool, events, config }
    }

    /// Re-reads the task row and its cost entries inside a transaction,
    /// computes `percentageUsed` against the task's own cap (falling back to
    /// unlimited if the cap is absent or zero), and emits the corresponding
    /// event after the transaction commits.
    pub async fn check_task_budget(&self, session_id: &str, task_id: &str) -> Result<BudgetVerdict> {
        let mut tx = self.pool.begin().await.context("failed to start task budget check transaction")?;
        let task = sqlx::query_as::<_, substrate_db::Task>(
            "SELECT * FROM tasks WHERE session_id = ? AND id = ?",
        )
        .bind(session_id)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to re-read task for budget check")?
        .with_context(|| format!("task {task_id:?} not found for budget check"))?;
        tx.commit().await.context("failed to commit task budget read")?;

        let cap = match task.budget_usd {
            Some(c) if c > 0.0 => c,
            _ => return Ok(BudgetVerdict::Continue),
        };

        let effective_cost = cost_entries::sum_effective_cost_for_task(&self.pool, session_id, task_id).await?;
        let percentage_used = (effective_cost / cap) * 100.0;

        if percentage_used >= 100.0 {
            warn!(session_id, task_id, effective_cost, cap, "task budget exceeded");
            self.events.emit(Event::BudgetExceededTask(BudgetExceededTask {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
                cap_usd: cap,
                effective_cost_usd: effective_cost,
            }));
            Ok(BudgetVerdict::Terminate)
        } else if percentage_used >= self.config.warning_threshold_pct {
            self.events.emit(Event::BudgetWarningTask(BudgetWarningTask {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
                percentage_used,
            }));
            Ok(BudgetVerdict::Continue)
        } else {
            Ok(BudgetVerdict::Continue)
        }
    }

    /// Re-reads the session row and the sum of effective cost entries. When
    /// `planning_cost_counts_against_budget` is false, the session's
    /// recorded planning cost is subtracted from the total before
    /// comparison.
    pub async fn check_session_budget(&self, session_id: &str) -> Result<BudgetVerdict> {
        let mut tx = self.pool.begin().await.context("failed to start session budget check transaction")?;
        let session = sqlx::query_as::<_, substrate_db::Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to re-read session for budget check")?
            .with_context(|| format!("session {session_id:?} not found for budget check"))?;
        tx.commit().await.context("failed to commit session budget read")?;

        let cap = match session.budget_usd {
            Some(c) if c > 0.0 => c,
            _ => return Ok(BudgetVerdict::Continue),
        };

        let total_effective = cost_entries::sum_effective_cost(&self.pool, session_id).await?;
        let effective_cost = if self.config.planning_cost_counts_against_budget {
            total_effective
        } else {
            (total_effective - session.planning_cost_usd).max(0.0)
        };

        let percentage_used = (effective_cost / cap) * 100.0;

        if percentage_used >= 100.0 {
            warn!(session_id, effective_cost, cap, "session budget exceeded");
            sessions::set_session_status(&self.pool, session_id, substrate_db::SessionStatus::Failed).await?;
            let cancelled = tasks::cancel_all_non_terminal(&self.pool, session_id).await?;
            warn!(session_id, cancelled = cancelled.len(), "cancelled remaining tasks after session budget exceedance");
            self.events.emit(Event::SessionBudgetExceeded(SessionBudgetExceeded {
                session_id: session_id.to_string(),
                cap_usd: cap,
                effective_cost_usd: effective_cost,
                action: "terminate-all".to_string(),
            }));
            Ok(BudgetVerdict::Terminate)
        } else if percentage_used >= self.config.warning_threshold_pct {
            self.events.emit(Event::BudgetWarningSession(crate::events::BudgetWarningSession {
                session_id: session_id.to_string(),
                percentage_used,
            }));
            Ok(BudgetVerdict::Continue)
        } else {
            Ok(BudgetVerdict::Continue)
        }
    }
}
