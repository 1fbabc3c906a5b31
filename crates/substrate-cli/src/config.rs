//! Configuration for the `substrate` CLI.
//!
//! Resolution chain: environment variables first, then a `substrate.toml`
//! file at the project root for anything not overridden, then hardcoded
//! defaults. Mirrors the lineage CLI's config module, minus the
//! auth/token-secret machinery this project has no use for.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use substrate_db::DbConfig;

const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_AGENT: &str = "generic-cli";

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    max_concurrency: Option<usize>,
    default_agent: Option<String>,
    base_branch: Option<String>,
}

fn load_config_file(project_root: &Path) -> Option<ConfigFile> {
    let path = project_root.join("substrate.toml");
    let contents = std::fs::read_to_string(path).ok()?;
    toml::from_str(&contents).ok()
}

/// Fully resolved configuration, ready for use by every subcommand.
#[derive(Debug)]
pub struct SubstrateConfig {
    pub project_root: PathBuf,
    pub db_config: DbConfig,
    pub max_concurrency: usize,
    pub default_agent: String,
    pub base_branch: String,
}

impl SubstrateConfig {
    /// Resolve configuration for a project rooted at `project_root` (or the
    /// current directory if `None`).
    ///
    /// - Project root: `project_root` arg > `SUBSTRATE_PROJECT_ROOT` env >
    ///   current directory.
    /// - Max concurrency: `SUBSTRATE_MAX_CONCURRENCY` env >
    ///   `substrate.toml`'s `max_concurrency` > default of 4.
    /// - Db path: `SUBSTRATE_DB_PATH` env (handled inside `DbConfig::from_env`)
    ///   > `{project_root}/.substrate/state.db`.
    pub fn resolve(project_root: Option<&Path>) -> Result<Self> {
        let project_root = match project_root {
            Some(p) => p.to_path_buf(),
            None => match std::env::var("SUBSTRATE_PROJECT_ROOT") {
                Ok(p) => PathBuf::from(p),
                Err(_) => std::env::current_dir().context("failed to resolve current directory")?,
            },
        };

        let file_config = load_config_file(&project_root).unwrap_or_default();

        let max_concurrency = std::env::var("SUBSTRATE_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file_config.max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);

        let default_agent = file_config.default_agent.unwrap_or_else(|| DEFAULT_AGENT.to_string());
        let base_branch = file_config.base_branch.unwrap_or_else(|| "main".to_string());

        let db_config = DbConfig::from_env(&project_root);

        Ok(Self { project_root, db_config, max_concurrency, default_agent, base_branch })
    }
}

/// Install a `tracing-subscriber` filter from `RUST_LOG`/`SUBSTRATE_LOG`,
/// defaulting to `info`.
pub fn init_logging() {
    let filter = std::env::var("SUBSTRATE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("SUBSTRATE_MAX_CONCURRENCY") };
        let dir = tempfile::TempDir::new().unwrap();

        let config = SubstrateConfig::resolve(Some(dir.path())).unwrap();
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.default_agent, DEFAULT_AGENT);
        assert_eq!(config.base_branch, "main");
    }

    #[test]
    fn env_var_overrides_config_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("substrate.toml"), "max_concurrency = 2\n").unwrap();

        unsafe { std::env::set_var("SUBSTRATE_MAX_CONCURRENCY", "9") };
        let config = SubstrateConfig::resolve(Some(dir.path())).unwrap();
        assert_eq!(config.max_concurrency, 9);
        unsafe { std::env::remove_var("SUBSTRATE_MAX_CONCURRENCY") };
    }

    #[test]
    fn config_file_overrides_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("SUBSTRATE_MAX_CONCURRENCY") };
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("substrate.toml"), "max_concurrency = 7\ndefault_agent = \"codex\"\n").unwrap();

        let config = SubstrateConfig::resolve(Some(dir.path())).unwrap();
        assert_eq!(config.max_concurrency, 7);
        assert_eq!(config.default_agent, "codex");
    }
}
