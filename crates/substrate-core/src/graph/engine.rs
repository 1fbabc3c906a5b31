//! Runtime state of the Task Graph Engine: persistence of a validated graph,
//! and the state-transition methods that drive tasks through
//! `pending → running → completed|failed|cancelled`.
//!
//! All transitions serialize through `critical_section`, a single
//! process-wide async mutex per engine instance. Individual writes within a
//! transition are further wrapped in a database transaction so a status row
//! and its `execution_log` entry are always committed together.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use substrate_db::queries::{execution_log, sessions, tasks};
use substrate_db::{Task, TaskStatus};

use crate::error::{EngineError, GraphError};
use crate::events::{
    Event, EventBus, GraphComplete, GraphLoaded, TaskCancelled, TaskComplete, TaskFailed, TaskReady,
    TaskRunning,
};

use super::schema::GraphDocument;
use super::validate::{validate, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loading,
    Executing,
    Paused,
}

/// Result of successfully loading and persisting a graph document.
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub session_id: String,
    pub task_count: usize,
    pub warnings: Vec<String>,
}

pub struct GraphEngine {
    pool: SqlitePool,
    events: EventBus,
    state: Arc<AsyncMutex<EngineState>>,
    critical_section: Arc<AsyncMutex<()>>,
}

impl GraphEngine {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self {
            pool,
            events,
            state: Arc::new(AsyncMutex::new(EngineState::Idle)),
            critical_section: Arc::new(AsyncMutex::new(())),
        }
    }

    pub async fn state(&self) -> EngineState {
        *self.state.lock().await
    }

    /// Validate `doc` and, if it passes, persist session + tasks + edges +
    /// an initial `graph:loaded` log entry in one transaction. All-or-
    /// nothing: on any validation error, nothing is written.
    pub async fn load_graph(
        &self,
        session_id: &str,
        graph_ref: &str,
        doc: GraphDocument,
        known_agents: &[String],
    ) -> Result<LoadSummary, Vec<GraphError>> {
        let report: ValidationReport = validate(&doc, known_agents)?;

        {
            let mut state = self.state.lock().await;
            *state = EngineState::Loading;
        }

        let task_count = doc.tasks.len();
        self.persist_graph(session_id, graph_ref, &doc)
            .await
            .map_err(|e| vec![GraphError::ParseError(e.to_string())])?;

        info!(session_id, task_count, "graph loaded");
        self.events.emit(Event::GraphLoaded(GraphLoaded {
            session_id: session_id.to_string(),
            task_count,
        }));

        Ok(LoadSummary { session_id: session_id.to_string(), task_count, warnings: report.warnings })
    }

    async fn persist_graph(&self, session_id: &str, graph_ref: &str, doc: &GraphDocument) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to start graph persistence transaction")?;

        let now = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO sessions (id, name, graph_ref, status, cost_usd, planning_cost_usd, \
             budget_usd, base_branch, created_at, updated_at) \
             VALUES (?, ?, ?, 'active', 0, 0, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&doc.session.name)
        .bind(graph_ref)
        .bind(doc.session.budget_usd)
        .bind(doc.session.base_branch.as_deref().unwrap_or("main"))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to insert session")?;

        for (id, task) in &doc.tasks {
            sqlx::query(
                "INSERT INTO tasks (session_id, id, name, prompt, task_type, status, agent, model, \
                 retry_count, max_retries, budget_usd, cost_usd, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, 0, ?, ?, 0, ?, ?)",
            )
            .bind(session_id)
            .bind(id)
            .bind(&task.name)
            .bind(&task.prompt)
            .bind(&task.task_type)
            .bind(&task.agent)
            .bind(&task.model)
            .bind(task.max_retries.unwrap_or(0))
            .bind(task.budget_usd)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to insert task")?;
        }

        for (id, task) in &doc.tasks {
            for dep in &task.depends_on {
                sqlx::query(
                    "INSERT OR IGNORE INTO task_dependencies (session_id, task_id, depends_on) \
                     VALUES (?, ?, ?)",
                )
                .bind(session_id)
                .bind(id)
                .bind(dep)
                .execute(&mut *tx)
                .await
                .context("failed to insert task dependency")?;
            }
        }

        sqlx::query(
            "INSERT INTO execution_log (session_id, task_id, event_kind, old_status, new_status, \
             agent, cost_delta_usd, data, recorded_at) \
             VALUES (?, NULL, 'graph:loaded', NULL, NULL, NULL, NULL, NULL, ?)",
        )
        .bind(session_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to append graph:loaded log entry")?;

        tx.commit().await.context("failed to commit graph persistence transaction")?;
        Ok(())
    }

    /// `Idle -> Loading -> Executing`; scans the ready-tasks view and emits
    /// `task:ready` for each. A graph with zero tasks emits `graph:complete`
    /// immediately.
    pub async fn start_execution(&self, session_id: &str) -> Result<()> {
        let _guard = self.critical_section.lock().await;

        {
            let mut state = self.state.lock().await;
            *state = EngineState::Executing;
        }
        sessions::set_session_status(&self.pool, session_id, substrate_db::SessionStatus::Active).await?;
        execution_log::append_log_entry(
            &self.pool,
            session_id,
            &execution_log::NewLogEntry {
                task_id: None,
                event_kind: "orchestrator:executing",
                old_status: Some("loading"),
                new_status: Some("executing"),
                agent: None,
                cost_delta_usd: None,
                data: None,
            },
        )
        .await?;

        let ready = tasks::get_ready_tasks(&self.pool, session_id).await?;
        if ready.is_empty() && tasks::is_session_drained(&self.pool, session_id).await? {
            info!(session_id, "graph has no tasks to run");
            self.events.emit(Event::GraphComplete(GraphComplete { session_id: session_id.to_string() }));
            return Ok(());
        }

        for task in ready {
            self.events.emit(Event::TaskReady(TaskReady {
                session_id: session_id.to_string(),
                task_id: task.id,
            }));
        }

        Ok(())
    }

    /// `pending|ready -> running`. Records the worker id and emits
    /// `task:running`.
    pub async fn mark_task_running(&self, session_id: &str, task_id: &str, worker_id: &str) -> Result<()> {
        let _guard = self.critical_section.lock().await;

        let affected = tasks::transition_task_status(
            &self.pool,
            session_id,
            task_id,
            TaskStatus::Pending,
            TaskStatus::Running,
            Some(worker_id),
            Some(chrono::Utc::now()),
            None,
        )
        .await?;

        if affected == 0 {
            let current = self.current_status(session_id, task_id).await?;
            return Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current,
                to: "running".to_string(),
            }
            .into());
        }

        self.log_transition(session_id, Some(task_id), "task:running", Some("pending"), Some("running"), Some(worker_id), None)
            .await?;

        debug!(session_id, task_id, worker_id, "task -> running");
        self.events.emit(Event::TaskRunning(TaskRunning {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        }));

        Ok(())
    }

    /// `running -> completed`. Records output and the cost delta, then
    /// recomputes newly-ready successors and emits `task:ready` for each. If
    /// the ready set is now empty and nothing is running, emits
    /// `graph:complete`.
    pub async fn mark_task_complete(&self, session_id: &str, task_id: &str, output: &str, cost_usd: f64) -> Result<()> {
        let _guard = self.critical_section.lock().await;

        let affected = tasks::complete_task(&self.pool, session_id, task_id, output, cost_usd).await?;
        if affected == 0 {
            let current = self.current_status(session_id, task_id).await?;
            return Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current,
                to: "completed".to_string(),
            }
            .into());
        }

        self.log_transition(session_id, Some(task_id), "task:complete", Some("running"), Some("completed"), None, Some(cost_usd))
            .await?;

        info!(session_id, task_id, cost_usd, "task -> completed");
        self.events.emit(Event::TaskComplete(TaskComplete {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            cost_usd,
        }));

        let newly_ready = tasks::get_ready_tasks(&self.pool, session_id).await?;
        if *self.state.lock().await != EngineState::Paused {
            for task in &newly_ready {
                self.events.emit(Event::TaskReady(TaskReady {
                    session_id: session_id.to_string(),
                    task_id: task.id.clone(),
                }));
            }
        }

        if newly_ready.is_empty() && tasks::is_session_drained(&self.pool, session_id).await? {
            let progress = tasks::get_session_progress(&self.pool, session_id).await?;
            let final_status = if progress.failed > 0 {
                substrate_db::SessionStatus::Failed
            } else {
                substrate_db::SessionStatus::Completed
            };
            sessions::set_session_status(&self.pool, session_id, final_status).await?;
            info!(session_id, "graph complete");
            self.events.emit(Event::GraphComplete(GraphComplete { session_id: session_id.to_string() }));
        }

        Ok(())
    }

    /// If `retry_count < max_retries`: `running -> pending`, increment
    /// retry, clear worker id, emit `task:ready`. Else: terminal `failed`,
    /// emit `task:failed`.
    pub async fn mark_task_failed(&self, session_id: &str, task_id: &str, error: &str, _exit_code: Option<i32>) -> Result<()> {
        let _guard = self.critical_section.lock().await;

        let task = tasks::get_task(&self.pool, session_id, task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
            })?;

        if task.retry_count < task.max_retries {
            let affected = tasks::retry_task_to_pending(&self.pool, session_id, task_id, task.retry_count).await?;
            if affected == 0 {
                return Err(EngineError::ConcurrentModification { task_id: task_id.to_string() }.into());
            }

            self.log_transition(session_id, Some(task_id), "task:failed:retry", Some("running"), Some("pending"), None, None)
                .await?;

            debug!(session_id, task_id, retry_count = task.retry_count + 1, "task failed, retrying");
            if *self.state.lock().await != EngineState::Paused {
                self.events.emit(Event::TaskReady(TaskReady {
                    session_id: session_id.to_string(),
                    task_id: task_id.to_string(),
                }));
            }
        } else {
            let affected = tasks::fail_task(&self.pool, session_id, task_id, error).await?;
            if affected == 0 {
                return Err(EngineError::ConcurrentModification { task_id: task_id.to_string() }.into());
            }

            self.log_transition(session_id, Some(task_id), "task:failed", Some("running"), Some("failed"), None, None)
                .await?;

            info!(session_id, task_id, error, "task -> failed (retries exhausted)");
            self.events.emit(Event::TaskFailed(TaskFailed {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
                error: error.to_string(),
                will_retry: false,
            }));

            if tasks::is_session_drained(&self.pool, session_id).await? {
                sessions::set_session_status(&self.pool, session_id, substrate_db::SessionStatus::Failed).await?;
                self.events.emit(Event::GraphComplete(GraphComplete { session_id: session_id.to_string() }));
            }
        }

        Ok(())
    }

    /// From any non-terminal state, transition to `cancelled`.
    pub async fn mark_task_cancelled(&self, session_id: &str, task_id: &str) -> Result<()> {
        let _guard = self.critical_section.lock().await;

        let now = chrono::Utc::now();
        let affected = sqlx::query(
            "UPDATE tasks SET status = 'cancelled', completed_at = ?, updated_at = ? \
             WHERE session_id = ? AND id = ? AND status IN ('pending', 'ready', 'running')",
        )
        .bind(now)
        .bind(now)
        .bind(session_id)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("failed to cancel task")?
        .rows_affected();

        if affected == 0 {
            let current = self.current_status(session_id, task_id).await?;
            return Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current,
                to: "cancelled".to_string(),
            }
            .into());
        }

        self.log_transition(session_id, Some(task_id), "task:cancelled", None, Some("cancelled"), None, None)
            .await?;

        self.events.emit(Event::TaskCancelled(TaskCancelled {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
        }));

        Ok(())
    }

    /// Toggle `Executing -> Paused`. While paused the engine does not emit
    /// new `task:ready` events; in-flight tasks continue to completion.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        if *state == EngineState::Executing {
            *state = EngineState::Paused;
        }
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if *state == EngineState::Paused {
            *state = EngineState::Executing;
        }
    }

    pub async fn is_paused(&self) -> bool {
        *self.state.lock().await == EngineState::Paused
    }

    async fn current_status(&self, session_id: &str, task_id: &str) -> Result<String> {
        let task: Option<Task> = tasks::get_task(&self.pool, session_id, task_id).await?;
        Ok(task.map(|t| t.status.to_string()).unwrap_or_else(|| "missing".to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_transition(
        &self,
        session_id: &str,
        task_id: Option<&str>,
        kind: &str,
        old_status: Option<&str>,
        new_status: Option<&str>,
        agent: Option<&str>,
        cost_delta_usd: Option<f64>,
    ) -> Result<()> {
        execution_log::append_log_entry(
            &self.pool,
            session_id,
            &execution_log::NewLogEntry { task_id, event_kind: kind, old_status, new_status, agent, cost_delta_usd, data: None },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use substrate_test_utils::temp_store;

    fn simple_doc() -> GraphDocument {
        let mut tasks = HashMap::new();
        tasks.insert(
            "a".to_string(),
            super::super::schema::TaskDoc {
                name: "A".to_string(),
                description: None,
                prompt: "do a".to_string(),
                task_type: "coding".to_string(),
                agent: None,
                model: None,
                budget_usd: None,
                max_retries: Some(1),
                depends_on: vec![],
            },
        );
        tasks.insert(
            "b".to_string(),
            super::super::schema::TaskDoc {
                name: "B".to_string(),
                description: None,
                prompt: "do b".to_string(),
                task_type: "coding".to_string(),
                agent: None,
                model: None,
                budget_usd: None,
                max_retries: Some(1),
                depends_on: vec!["a".to_string()],
            },
        );
        GraphDocument {
            version: "1".to_string(),
            session: super::super::schema::SessionDoc { name: "demo".to_string(), budget_usd: None, base_branch: None },
            tasks,
        }
    }

    #[tokio::test]
    async fn load_then_start_emits_ready_for_root_task_only() {
        let store = temp_store().await;
        let events = EventBus::new();
        let ready = Arc::new(AsyncMutex::new(Vec::new()));
        let r = Arc::clone(&ready);
        events.subscribe(crate::events::EventKind::TaskReady, move |e| {
            if let Event::TaskReady(p) = e {
                r.blocking_lock().push(p.task_id.clone());
            }
        });

        let engine = GraphEngine::new(store.pool.clone(), events);
        engine.load_graph("s1", "graph.yaml", simple_doc(), &[]).await.unwrap();
        engine.start_execution("s1").await.unwrap();

        assert_eq!(*ready.lock().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn complete_task_emits_ready_for_successor() {
        let store = temp_store().await;
        let events = EventBus::new();
        let engine = GraphEngine::new(store.pool.clone(), events);
        engine.load_graph("s1", "graph.yaml", simple_doc(), &[]).await.unwrap();
        engine.start_execution("s1").await.unwrap();

        engine.mark_task_running("s1", "a", "w1").await.unwrap();
        engine.mark_task_complete("s1", "a", "done", 0.1).await.unwrap();

        let task = substrate_db::queries::tasks::get_task(&store.pool, "s1", "b").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn failed_task_under_retry_cap_returns_to_pending() {
        let store = temp_store().await;
        let events = EventBus::new();
        let engine = GraphEngine::new(store.pool.clone(), events);
        engine.load_graph("s1", "graph.yaml", simple_doc(), &[]).await.unwrap();
        engine.start_execution("s1").await.unwrap();

        engine.mark_task_running("s1", "a", "w1").await.unwrap();
        engine.mark_task_failed("s1", "a", "boom", Some(1)).await.unwrap();

        let task = substrate_db::queries::tasks::get_task(&store.pool, "s1", "a").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn failed_task_over_retry_cap_becomes_terminal() {
        let store = temp_store().await;
        let events = EventBus::new();
        let engine = GraphEngine::new(store.pool.clone(), events);
        engine.load_graph("s1", "graph.yaml", simple_doc(), &[]).await.unwrap();
        engine.start_execution("s1").await.unwrap();

        engine.mark_task_running("s1", "a", "w1").await.unwrap();
        engine.mark_task_failed("s1", "a", "boom", Some(1)).await.unwrap(); // retry 1/1
        engine.mark_task_running("s1", "a", "w2").await.unwrap();
        engine.mark_task_failed("s1", "a", "boom again", Some(1)).await.unwrap(); // exhausted

        let task = substrate_db::queries::tasks::get_task(&store.pool, "s1", "a").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn empty_graph_emits_graph_complete_immediately() {
        let store = temp_store().await;
        let events = EventBus::new();
        let completed = Arc::new(AsyncMutex::new(false));
        let c = Arc::clone(&completed);
        events.subscribe(crate::events::EventKind::GraphComplete, move |_| {
            *c.blocking_lock() = true;
        });

        let engine = GraphEngine::new(store.pool.clone(), events);
        let doc = GraphDocument {
            version: "1".to_string(),
            session: super::super::schema::SessionDoc { name: "demo".to_string(), budget_usd: None, base_branch: None },
            tasks: HashMap::from([(
                "a".to_string(),
                super::super::schema::TaskDoc {
                    name: "A".to_string(),
                    description: None,
                    prompt: "go".to_string(),
                    task_type: "coding".to_string(),
                    agent: None,
                    model: None,
                    budget_usd: None,
                    max_retries: Some(0),
                    depends_on: vec![],
                },
            )]),
        };
        engine.load_graph("s1", "graph.yaml", doc, &[]).await.unwrap();
        engine.start_execution("s1").await.unwrap();
        engine.mark_task_running("s1", "a", "w1").await.unwrap();
        engine.mark_task_complete("s1", "a", "done", 0.0).await.unwrap();

        assert!(*completed.lock().await);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_state() {
        let store = temp_store().await;
        let events = EventBus::new();
        let engine = GraphEngine::new(store.pool.clone(), events);
        engine.load_graph("s1", "graph.yaml", simple_doc(), &[]).await.unwrap();
        engine.start_execution("s1").await.unwrap();

        engine.pause().await;
        assert!(engine.is_paused().await);
        engine.resume().await;
        assert!(!engine.is_paused().await);
    }

    #[tokio::test]
    async fn paused_engine_suppresses_task_ready_until_resumed() {
        let store = temp_store().await;
        let events = EventBus::new();
        let ready = Arc::new(AsyncMutex::new(Vec::new()));
        let r = Arc::clone(&ready);
        events.subscribe(crate::events::EventKind::TaskReady, move |e| {
            if let Event::TaskReady(p) = e {
                r.blocking_lock().push(p.task_id.clone());
            }
        });

        let engine = GraphEngine::new(store.pool.clone(), events);
        engine.load_graph("s1", "graph.yaml", simple_doc(), &[]).await.unwrap();
        engine.start_execution("s1").await.unwrap();
        ready.lock().await.clear();

        engine.mark_task_running("s1", "a", "w1").await.unwrap();
        engine.pause().await;
        engine.mark_task_complete("s1", "a", "done", 0.1).await.unwrap();

        assert!(ready.lock().await.is_empty(), "no task:ready should fire while paused");

        engine.resume().await;
        let newly_ready = substrate_db::queries::tasks::get_ready_tasks(&store.pool, "s1").await.unwrap();
        assert_eq!(newly_ready.len(), 1);
        assert_eq!(newly_ready[0].id, "b");
    }
}
