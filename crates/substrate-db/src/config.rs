use std::env;
use std::path::{Path, PathBuf};

/// Database configuration: the filesystem path to the embedded store.
///
/// Reads from the `SUBSTRATE_DB_PATH` environment variable, falling back to
/// `{project_root}/.substrate/state.db`.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
}

impl DbConfig {
    /// Build a config rooted at `project_root`, honoring `SUBSTRATE_DB_PATH`
    /// when set.
    pub fn from_env(project_root: &Path) -> Self {
        let database_path = env::var("SUBSTRATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path(project_root));
        Self { database_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// The default database path under a given project root.
    pub fn default_path(project_root: &Path) -> PathBuf {
        project_root.join(".substrate").join("state.db")
    }

    /// A `sqlx` connection URL for this path. `mode=rwc` creates the file
    /// (and its parent directory must already exist) on first connect.
    pub fn connection_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.database_path.display())
    }

    /// The directory containing the database file (`.substrate/`).
    pub fn state_dir(&self) -> Option<&Path> {
        self.database_path.parent()
    }
}
