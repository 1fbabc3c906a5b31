//! Orchestrator Lifecycle: the factory-constructed graph of every other
//! component, wired together for one orchestration run.
//!
//! `initialize()` opens the store, runs migrations, builds components in
//! dependency order, runs crash recovery, wires the event subscriptions that
//! turn `task:ready` into dispatched work, starts the signal-polling loop,
//! and emits `orchestrator:ready`. `shutdown(reason)` reverses this:
//! pauses the engine, returns in-flight work to `pending`, marks the
//! session `interrupted`, checkpoints the write-ahead log, and emits
//! `orchestrator:shutdown`. Shutdown is idempotent.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use substrate_db::{queries::signals, pool as db_pool, DbConfig, SessionStatus, SignalKind};

use crate::adapter::AdapterRegistry;
use crate::budget::{BudgetConfig, BudgetEnforcer};
use crate::error::AdapterError;
use crate::events::{Event, EventBus, EventKind, OrchestratorReady, OrchestratorShutdown};
use crate::graph::GraphEngine;
use crate::recovery::RecoveryManager;
use crate::router::{Router, RoutingPolicy};
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::worktree::WorktreeManager;

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct OrchestratorConfig {
    pub project_root: std::path::PathBuf,
    pub max_concurrency: usize,
    pub default_agent: String,
    pub base_branch: String,
    pub routing_policy: RoutingPolicy,
    pub budget: BudgetConfig,
}

/// The assembled component graph for one orchestration run.
pub struct Orchestrator {
    pool: SqlitePool,
    events: EventBus,
    engine: Arc<GraphEngine>,
    worktrees: Arc<WorktreeManager>,
    worker_pool: Arc<WorkerPool>,
    recovery: RecoveryManager,
    signal_task: AsyncMutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    /// Open the store, run migrations, build every component, run crash
    /// recovery, wire subscriptions, and emit `orchestrator:ready`.
    pub async fn initialize(config: OrchestratorConfig, adapters: AdapterRegistry) -> Result<Arc<Self>> {
        let db_config = DbConfig::from_env(&config.project_root);
        let pool = db_pool::create_pool(&db_config).await.context("failed to open durable store")?;
        db_pool::run_migrations(&pool, db_pool::default_migrations_path())
            .await
            .context("failed to run database migrations")?;

        let events = EventBus::new();

        let worktrees = Arc::new(
            WorktreeManager::new(&config.project_root, events.clone())
                .context("project root is not a usable git repository")?,
        );
        worktrees.verify_git_version().context("git is missing or too old")?;

        for id in adapters.list() {
            let adapter = adapters.get(id).expect("id came from list()");
            let health = adapter.health_check().await;
            if !health.healthy {
                return Err(AdapterError::Unhealthy {
                    adapter: id.to_string(),
                    reason: health.error.unwrap_or_else(|| "adapter reported unhealthy".to_string()),
                }
                .into());
            }
        }

        let engine = Arc::new(GraphEngine::new(pool.clone(), events.clone()));
        let router = Arc::new(Router::new(config.routing_policy));
        let budget = Arc::new(BudgetEnforcer::new(pool.clone(), events.clone(), config.budget));
        let adapters = Arc::new(adapters);

        let worker_pool = Arc::new(WorkerPool::new(
            pool.clone(),
            events.clone(),
            Arc::clone(&engine),
            Arc::clone(&worktrees),
            adapters,
            router,
            budget,
            WorkerPoolConfig {
                max_concurrency: config.max_concurrency,
                base_branch: config.base_branch,
                default_agent: config.default_agent,
            },
        ));

        let recovery = RecoveryManager::new(pool.clone(), (*worktrees).clone());

        let orchestrator = Arc::new(Self {
            pool,
            events: events.clone(),
            engine,
            worktrees,
            worker_pool,
            recovery,
            signal_task: AsyncMutex::new(None),
            shutting_down: AtomicBool::new(false),
        });

        // Wire task:ready -> dispatch. The handler only enqueues work; the
        // actual run happens on a spawned tokio task inside `dispatch`.
        let dispatcher = Arc::clone(&orchestrator.worker_pool);
        events.subscribe(EventKind::TaskReady, move |event| {
            if let Event::TaskReady(payload) = event {
                dispatcher.dispatch(payload.session_id.clone(), payload.task_id.clone());
            }
        });

        // Crash recovery runs before any new work is accepted: if an
        // unclean shutdown left a session `interrupted`, reset its orphaned
        // tasks, reclaim dangling worktrees, and resume dispatching it.
        if let Some(interrupted) = orchestrator.recovery.find_interrupted_session().await? {
            let session_id = interrupted.id.clone();
            info!(session_id = %session_id, "recovering interrupted session at startup");
            orchestrator.recovery.recover_session(&session_id).await?;
            orchestrator.engine.start_execution(&session_id).await?;
            orchestrator.start_signal_polling(session_id);
        }

        events.emit(Event::OrchestratorReady(OrchestratorReady {
            session_id: String::new(),
            at: now(),
        }));

        Ok(orchestrator)
    }

    pub fn engine(&self) -> &Arc<GraphEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run crash recovery for a specific session before resuming it. Not
    /// part of `initialize()` since the session to recover is only known
    /// once a `resume` driver has picked one.
    pub async fn recover_session(&self, session_id: &str) -> Result<()> {
        self.recovery.recover_session(session_id).await?;
        Ok(())
    }

    pub async fn find_interrupted_session(&self) -> Result<Option<substrate_db::Session>> {
        self.recovery.find_interrupted_session().await
    }

    /// Start the ~500ms signal-polling loop for `session_id`. Stops once
    /// `shutdown` has been called or the session reaches a terminal status.
    pub fn start_signal_polling(self: &Arc<Self>, session_id: String) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if this.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(SIGNAL_POLL_INTERVAL).await;

                match signals::drain_signals(&this.pool, &session_id).await {
                    Ok(drained) => {
                        for signal in drained {
                            match signal.signal {
                                SignalKind::Pause => this.engine.pause().await,
                                SignalKind::Resume => this.engine.resume().await,
                                SignalKind::Cancel => {
                                    if let Err(e) = this.cancel_session(&session_id).await {
                                        warn!(session_id = %session_id, error = %e, "failed to cancel session");
                                    }
                                    this.shutdown("cancelled".to_string(), Some(session_id.clone())).await.ok();
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(session_id = %session_id, error = %e, "failed to poll session signals"),
                }
            }
        });

        tokio::spawn({
            let this = Arc::clone(self);
            async move {
                let mut guard = this.signal_task.lock().await;
                *guard = Some(handle);
            }
        });
    }

    async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let cancelled = substrate_db::queries::tasks::cancel_all_non_terminal(&self.pool, session_id).await?;
        for task_id in &cancelled {
            self.worker_pool.cancel(task_id).await;
        }
        Ok(())
    }

    /// Pause the engine, return running tasks to `pending` with incremented
    /// retry counters, mark the session `interrupted`, checkpoint the
    /// write-ahead log, emit `orchestrator:shutdown`, and return.
    /// Idempotent: a second call is a no-op.
    pub async fn shutdown(&self, reason: String, session_id: Option<String>) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.engine.pause().await;

        if let Some(session_id) = &session_id {
            let (retried, failed) = substrate_db::queries::tasks::reset_orphaned_tasks(&self.pool, session_id).await?;
            info!(session_id, retried = retried.len(), failed = failed.len(), "returned in-flight tasks on shutdown");
            substrate_db::queries::sessions::set_session_status(&self.pool, session_id, SessionStatus::Interrupted)
                .await?;
        }

        if let Some(handle) = self.signal_task.lock().await.take() {
            handle.abort();
        }

        db_pool::checkpoint(&self.pool).await.context("failed to checkpoint write-ahead log on shutdown")?;

        self.events.emit(Event::OrchestratorShutdown(OrchestratorShutdown {
            session_id: session_id.unwrap_or_default(),
            reason,
            at: now(),
        }));

        Ok(())
    }

    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.worktrees
    }
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::cli::CliAdapter;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::process::Command::new("git").arg("init").arg("-q").current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git").args(["config", "user.name", "t"]).current_dir(dir.path()).status().unwrap();
        std::fs::write(dir.path().join("README.md"), "x").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir.path()).status().unwrap();
        dir
    }

    #[tokio::test]
    async fn initialize_opens_store_and_emits_ready() {
        let dir = init_repo();
        std::env::set_var("SUBSTRATE_DB_PATH", dir.path().join(".substrate/state.db"));

        let mut adapters = AdapterRegistry::new();
        adapters.register(CliAdapter::new("generic-cli", "true"));

        let config = OrchestratorConfig {
            project_root: dir.path().to_path_buf(),
            max_concurrency: 2,
            default_agent: "generic-cli".to_string(),
            base_branch: "main".to_string(),
            routing_policy: RoutingPolicy::default(),
            budget: BudgetConfig::default(),
        };

        let orchestrator = Orchestrator::initialize(config, adapters).await.unwrap();
        orchestrator.shutdown("test complete".to_string(), None).await.unwrap();

        std::env::remove_var("SUBSTRATE_DB_PATH");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = init_repo();
        std::env::set_var("SUBSTRATE_DB_PATH", dir.path().join(".substrate/state2.db"));

        let mut adapters = AdapterRegistry::new();
        adapters.register(CliAdapter::new("generic-cli", "true"));

        let config = OrchestratorConfig {
            project_root: dir.path().to_path_buf(),
            max_concurrency: 1,
            default_agent: "generic-cli".to_string(),
            base_branch: "main".to_string(),
            routing_policy: RoutingPolicy::default(),
            budget: BudgetConfig::default(),
        };

        let orchestrator = Orchestrator::initialize(config, adapters).await.unwrap();
        orchestrator.shutdown("first".to_string(), None).await.unwrap();
        orchestrator.shutdown("second".to_string(), None).await.unwrap();

        std::env::remove_var("SUBSTRATE_DB_PATH");
    }

    #[tokio::test]
    async fn initialize_fails_fast_on_unhealthy_adapter() {
        let dir = init_repo();
        std::env::set_var("SUBSTRATE_DB_PATH", dir.path().join(".substrate/state3.db"));

        let mut adapters = AdapterRegistry::new();
        adapters.register(CliAdapter::new("broken", "/nonexistent/binary-substrate-test"));

        let config = OrchestratorConfig {
            project_root: dir.path().to_path_buf(),
            max_concurrency: 1,
            default_agent: "broken".to_string(),
            base_branch: "main".to_string(),
            routing_policy: RoutingPolicy::default(),
            budget: BudgetConfig::default(),
        };

        let err = Orchestrator::initialize(config, adapters).await.unwrap_err();
        assert!(err.downcast_ref::<AdapterError>().is_some(), "expected AdapterError::Unhealthy, got {err:?}");

        std::env::remove_var("SUBSTRATE_DB_PATH");
    }

    #[tokio::test]
    async fn initialize_recovers_an_interrupted_session_automatically() {
        let dir = init_repo();
        std::env::set_var("SUBSTRATE_DB_PATH", dir.path().join(".substrate/state4.db"));

        let db_config = substrate_db::DbConfig::from_env(dir.path());
        let pool = db_pool::create_pool(&db_config).await.unwrap();
        db_pool::run_migrations(&pool, db_pool::default_migrations_path()).await.unwrap();

        substrate_db::queries::sessions::insert_session(&pool, "s1", "demo", "generic-cli", None, "main").await.unwrap();
        substrate_db::queries::sessions::set_session_status(&pool, "s1", SessionStatus::Interrupted).await.unwrap();
        substrate_db::queries::tasks::insert_task(
            &pool,
            "s1",
            &substrate_db::queries::tasks::NewTask {
                id: "a",
                name: "A",
                prompt: "go",
                task_type: "coding",
                agent: Some("generic-cli"),
                model: None,
                budget_usd: None,
                max_retries: 0,
            },
        )
        .await
        .unwrap();
        substrate_db::queries::tasks::transition_task_status(
            &pool,
            "s1",
            "a",
            substrate_db::TaskStatus::Pending,
            substrate_db::TaskStatus::Running,
            Some("stale-worker"),
            Some(chrono::Utc::now()),
            None,
        )
        .await
        .unwrap();
        pool.close().await;

        let mut adapters = AdapterRegistry::new();
        adapters.register(CliAdapter::new("generic-cli", "true"));

        let config = OrchestratorConfig {
            project_root: dir.path().to_path_buf(),
            max_concurrency: 1,
            default_agent: "generic-cli".to_string(),
            base_branch: "main".to_string(),
            routing_policy: RoutingPolicy::default(),
            budget: BudgetConfig::default(),
        };

        let orchestrator = Orchestrator::initialize(config, adapters).await.unwrap();

        let task = substrate_db::queries::tasks::get_task(orchestrator.pool(), "s1", "a").await.unwrap().unwrap();
        assert_ne!(task.status, substrate_db::TaskStatus::Running, "orphaned running task should have been reset by recovery");

        orchestrator.shutdown("test complete".to_string(), Some("s1".to_string())).await.unwrap();
        std::env::remove_var("SUBSTRATE_DB_PATH");
    }
}
