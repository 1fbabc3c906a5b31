//! Git worktree management: the Git Worktree Manager component.
//!
//! Each task runs in its own git worktree on a dedicated branch, giving
//! filesystem isolation without a full repository clone. Worktrees share
//! the object store of the main repository but have independent working
//! directories and index files.
//!
//! Branch naming: `substrate/task-{taskId}`. Worktree layout:
//! `{projectRoot}/.substrate-worktrees/{taskId}/`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::WorktreeError;
use crate::events::{Event, EventBus, EventKind, WorktreeConflict, WorktreeCreated, WorktreeRemoved};

/// Result of a merge simulation or real merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success { merged_files: Vec<String> },
    Conflict { details: String, conflicting_files: Vec<String> },
}

/// Information about a single git worktree, as reported by `listWorktrees`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

fn task_branch_name(task_id: &str) -> String {
    format!("substrate/task-{task_id}")
}

/// Manages git worktrees under `{projectRoot}/.substrate-worktrees/`.
#[derive(Clone)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    events: EventBus,
    /// Git worktree operations are not safe to run concurrently against the
    /// same repository; this serializes every mutating call.
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Construct a manager rooted at `repo_path`, verifying it is a git
    /// repository. Worktrees are placed at
    /// `{repo_path}/.substrate-worktrees/`.
    pub fn new(repo_path: impl Into<PathBuf>, events: EventBus) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("-C")
            .arg(&repo_path)
            .args(["rev-parse", "--git-dir"])
            .output()
            .map_err(|source| WorktreeError::GitCommand {
                message: "git rev-parse --git-dir".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = repo_path.join(".substrate-worktrees");

        Ok(Self {
            repo_path,
            worktree_base,
            events,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Require a minimum usable git version; fail-fast at initialize.
    pub fn verify_git_version(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git").arg("--version").output().map_err(|source| {
            WorktreeError::GitCommand { message: "git --version".to_string(), source }
        })?;
        if !output.status.success() {
            return Err(WorktreeError::UnsupportedGitVersion("git --version failed".to_string()));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let version = text.trim().strip_prefix("git version ").unwrap_or(text.trim());
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WorktreeError::UnsupportedGitVersion(version.to_string()))?;
        if major < 2 {
            return Err(WorktreeError::UnsupportedGitVersion(version.to_string()));
        }
        Ok(())
    }

    fn run_git(&self, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
        Command::new("git").arg("-C").arg(&self.repo_path).args(args).output().map_err(|source| {
            WorktreeError::GitCommand { message: format!("git {}", args.join(" ")), source }
        })
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = self.run_git(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])?;
        Ok(output.status.success())
    }

    /// Create branch `substrate/task-{taskId}` off `baseBranch`, then add a
    /// worktree for it. Idempotent: if the worktree already exists on the
    /// expected branch, does nothing and re-emits `worktree:created`.
    pub fn create_worktree(
        &self,
        session_id: &str,
        task_id: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _guard = self.git_lock.lock().expect("worktree git lock poisoned");

        let branch = task_branch_name(task_id);
        let path = self.worktree_base.join(task_id);

        if let Some(existing) = self.find_worktree_by_path(&path)? {
            if existing.branch.as_deref() == Some(branch.as_str()) {
                debug!(task_id, "worktree already exists, reusing");
                self.events.emit(Event::WorktreeCreated(WorktreeCreated {
                    session_id: session_id.to_string(),
                    task_id: task_id.to_string(),
                    path: path.display().to_string(),
                    branch: branch.clone(),
                }));
                return Ok(existing);
            }
            return Err(WorktreeError::BranchMismatch { task_id: task_id.to_string() });
        }

        std::fs::create_dir_all(&self.worktree_base).map_err(|source| WorktreeError::GitCommand {
            message: "create worktree base directory".to_string(),
            source,
        })?;

        let result = (|| -> Result<(), WorktreeError> {
            let path_str = path.to_string_lossy().to_string();
            let args: Vec<&str> = if self.branch_exists(&branch)? {
                vec!["worktree", "add", &path_str, &branch]
            } else {
                vec!["worktree", "add", "-b", &branch, &path_str, base_branch]
            };
            let output = self.run_git(&args)?;
            if !output.status.success() {
                return Err(WorktreeError::GitExit {
                    command: "worktree add".to_string(),
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
            Ok(())
        })();

        if let Err(e) = result {
            self.cleanup_partial(&path);
            return Err(e);
        }

        let head = self.head_commit_of(&path)?;

        self.events.emit(Event::WorktreeCreated(WorktreeCreated {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            path: path.display().to_string(),
            branch: branch.clone(),
        }));

        Ok(WorktreeInfo { path, branch: Some(branch), head_commit: head })
    }

    fn head_commit_of(&self, path: &Path) -> Result<String, WorktreeError> {
        let output =
            Command::new("git").arg("-C").arg(path).args(["rev-parse", "HEAD"]).output().map_err(
                |source| WorktreeError::GitCommand { message: "git rev-parse HEAD".to_string(), source },
            )?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn cleanup_partial(&self, path: &Path) {
        let _ = std::fs::remove_dir_all(path);
        let _ = self.run_git(&["worktree", "prune"]);
    }

    /// Idempotent: remove a task's worktree directory and delete its branch.
    /// Errors are logged, not propagated -- cleanup must never block task
    /// completion.
    pub fn cleanup_worktree(&self, session_id: &str, task_id: &str) {
        let _guard = self.git_lock.lock().expect("worktree git lock poisoned");
        let path = self.worktree_base.join(task_id);
        let branch = task_branch_name(task_id);

        if path.exists() {
            if let Ok(output) = self.run_git(&[
                "worktree",
                "remove",
                "--force",
                &path.to_string_lossy(),
            ]) {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if !stderr.contains("is not a working tree") {
                        warn!(task_id, %stderr, "git worktree remove failed during cleanup");
                    }
                }
            }
            let _ = std::fs::remove_dir_all(&path);
        }

        if let Ok(output) = self.run_git(&["branch", "-D", &branch]) {
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("not found") {
                    warn!(task_id, %stderr, "git branch -D failed during cleanup");
                }
            }
        }

        self.events.emit(Event::WorktreeRemoved(WorktreeRemoved {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
        }));
    }

    /// On startup: scan `.substrate-worktrees/*`, cross-reference each
    /// directory against `running_or_queued_task_ids`; anything that is
    /// neither a known task nor one of those ids is reclaimed. Returns the
    /// count of worktrees removed.
    pub fn cleanup_all_worktrees(&self, running_or_queued_task_ids: &[String]) -> usize {
        let _guard = self.git_lock.lock().expect("worktree git lock poisoned");
        let Ok(entries) = std::fs::read_dir(&self.worktree_base) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(task_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if running_or_queued_task_ids.iter().any(|id| id == &task_id) {
                continue;
            }

            let path = entry.path();
            let branch = task_branch_name(&task_id);
            let _ = self.run_git(&["worktree", "remove", "--force", &path.to_string_lossy()]);
            let _ = std::fs::remove_dir_all(&path);
            let _ = self.run_git(&["branch", "-D", &branch]);
            removed += 1;
        }

        let _ = self.run_git(&["worktree", "prune"]);
        removed
    }

    /// Simulate merging a task's branch into `target_branch`: attempt the
    /// merge in the main working directory, collect conflicting paths, and
    /// always abort afterward so the working directory is left untouched.
    pub fn detect_conflicts(&self, task_id: &str, target_branch: &str) -> Result<Option<Vec<String>>, WorktreeError> {
        let _guard = self.git_lock.lock().expect("worktree git lock poisoned");
        let branch = task_branch_name(task_id);

        self.checkout(target_branch)?;

        let merge = self.run_git(&["merge", "--no-commit", "--no-ff", &branch])?;
        let conflicts = if !merge.status.success() {
            let list = self.run_git(&["diff", "--name-only", "--diff-filter=U"])?;
            Some(
                String::from_utf8_lossy(&list.stdout)
                    .lines()
                    .map(str::to_string)
                    .filter(|l| !l.is_empty())
                    .collect(),
            )
        } else {
            None
        };

        let _ = self.run_git(&["merge", "--abort"]);

        Ok(conflicts)
    }

    /// Merge a task's branch into `target_branch`. Detects conflicts first;
    /// if none, performs a real `--no-ff` merge and returns the merged file
    /// list.
    pub fn merge_worktree(
        &self,
        session_id: &str,
        task_id: &str,
        target_branch: &str,
    ) -> Result<MergeResult, WorktreeError> {
        if let Some(conflicting_files) = self.detect_conflicts(task_id, target_branch)? {
            self.events.emit(Event::WorktreeConflict(WorktreeConflict {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
                target_branch: target_branch.to_string(),
                conflicting_files: conflicting_files.clone(),
            }));
            return Ok(MergeResult::Conflict {
                details: format!("conflicts merging into {target_branch}"),
                conflicting_files,
            });
        }

        let _guard = self.git_lock.lock().expect("worktree git lock poisoned");
        let branch = task_branch_name(task_id);

        self.checkout(target_branch)?;
        let output = self.run_git(&["merge", "--no-ff", &branch])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "merge --no-ff".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let show = self.run_git(&["diff", "--name-only", "HEAD~1..HEAD"])?;
        let merged_files: Vec<String> = String::from_utf8_lossy(&show.stdout)
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect();

        Ok(MergeResult::Success { merged_files })
    }

    fn checkout(&self, branch: &str) -> Result<(), WorktreeError> {
        let output = self.run_git(&["checkout", branch])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "checkout".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// The current set of worktree directories.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = self.run_git(&["worktree", "list", "--porcelain"])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree list".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<Option<WorktreeInfo>, WorktreeError> {
        let canonical_target = path.canonicalize();
        for info in self.list_worktrees()? {
            let canonical = info.path.canonicalize().unwrap_or_else(|_| info.path.clone());
            let target = canonical_target.clone().unwrap_or_else(|_| path.to_path_buf());
            if canonical == target {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    /// Registered but no-longer-present worktrees; `git worktree prune`.
    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let _guard = self.git_lock.lock().expect("worktree git lock poisoned");
        let output = self.run_git(&["worktree", "prune"])?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree prune".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

/// Parse `git worktree list --porcelain` output into [`WorktreeInfo`]
/// records. Entries are blank-line-delimited blocks of `worktree `/`HEAD `/
/// `branch `-prefixed lines.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut infos = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    let flush = |path: &mut Option<PathBuf>, head: &mut Option<String>, branch: &mut Option<String>, infos: &mut Vec<WorktreeInfo>| {
        if let (Some(p), Some(h)) = (path.take(), head.take()) {
            infos.push(WorktreeInfo { path: p, branch: branch.take(), head_commit: h });
        } else {
            *branch = None;
        }
    };

    for line in output.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch, &mut infos);
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
    }
    flush(&mut path, &mut head, &mut branch, &mut infos);

    Ok(infos)
}
