//! Isolated working trees (§4.6)
//!
//! Every task runs inside its own git worktree, separate from the project
//! root, so concurrent tasks never step on each other's working copy. A
//! worktree is created once per task, reused if still present, and deleted
//! on success — retried a few times to tolerate a transient file lock from
//! an editor or AV scanner still holding a handle open.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

const REMOVE_RETRIES: u32 = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("rebase conflict in worktree: {0}")]
    RebaseConflict(String),

    #[error("worktree not found: {0}")]
    NotFound(String),

    #[error("worktree corrupted: {0}")]
    Corrupted(String),

    #[error("git command failed: {0}")]
    GitError(String),
}

#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory under which every task's worktree is created.
    pub base_dir: PathBuf,
    /// Path to the project repository the worktrees are cloned from.
    pub repo_root: PathBuf,
    /// Branch prefix: a task named `fix-bug` gets `{branch_prefix}/fix-bug`.
    pub branch_prefix: String,
    /// Branch `rebase` targets.
    pub base_branch: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".takt/worktrees"),
            repo_root: PathBuf::from("."),
            branch_prefix: "takt".to_string(),
            base_branch: "main".to_string(),
        }
    }
}

impl WorktreeConfig {
    pub fn with_repo(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub task_name: String,
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorktreeManager {
    config: WorktreeConfig,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        debug!(?config, "WorktreeManager::new: called");
        Self { config }
    }

    /// Create a worktree for `task_name`, or return the existing one if the
    /// scheduler already created it for a prior attempt.
    pub async fn create_or_reuse(&self, task_name: &str) -> Result<WorktreeInfo, WorktreeError> {
        debug!(%task_name, "WorktreeManager::create_or_reuse: called");
        let worktree_path = self.worktree_path(task_name);
        let branch_name = format!("{}/{}", self.config.branch_prefix, task_name);

        if worktree_path.exists() {
            debug!(%task_name, "WorktreeManager::create_or_reuse: reusing existing worktree");
            return Ok(WorktreeInfo {
                task_name: task_name.to_string(),
                path: worktree_path,
                branch: branch_name,
            });
        }

        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::CreateFailed(format!("failed to create base dir: {e}")))?;

        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                worktree_path.to_str().unwrap_or_default(),
                "-b",
                &branch_name,
                "HEAD",
            ])
            .current_dir(&self.config.repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::CreateFailed(stderr.to_string()));
        }

        info!(%task_name, ?worktree_path, branch = %branch_name, "WorktreeManager::create_or_reuse: created");
        Ok(WorktreeInfo {
            task_name: task_name.to_string(),
            path: worktree_path,
            branch: branch_name,
        })
    }

    /// Delete a task's worktree, retrying a few times on failure to ride
    /// out a transient lock held by another process.
    pub async fn remove(&self, task_name: &str) -> Result<(), WorktreeError> {
        debug!(%task_name, "WorktreeManager::remove: called");
        let worktree_path = self.worktree_path(task_name);

        if !worktree_path.exists() {
            debug!(%task_name, "WorktreeManager::remove: already gone, skipping");
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 1..=REMOVE_RETRIES {
            match self.remove_once(&worktree_path).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(%task_name, attempt, error = %e, "WorktreeManager::remove: attempt failed");
                    last_err = Some(e);
                    if attempt < REMOVE_RETRIES {
                        tokio::time::sleep(REMOVE_RETRY_DELAY).await;
                    }
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        let branch_name = format!("{}/{}", self.config.branch_prefix, task_name);
        let _ = Command::new("git")
            .args(["branch", "-D", &branch_name])
            .current_dir(&self.config.repo_root)
            .output()
            .await;

        info!(%task_name, "WorktreeManager::remove: removed");
        Ok(())
    }

    async fn remove_once(&self, worktree_path: &Path) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "remove", worktree_path.to_str().unwrap_or_default(), "--force"])
            .current_dir(&self.config.repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::RemoveFailed(stderr.to_string()));
        }
        Ok(())
    }

    /// Rebase a task's worktree onto the configured base branch, committing
    /// any uncommitted work first.
    pub async fn rebase(&self, task_name: &str) -> Result<(), WorktreeError> {
        debug!(%task_name, "WorktreeManager::rebase: called");
        let worktree_path = self.worktree_path(task_name);
        if !worktree_path.exists() {
            return Err(WorktreeError::NotFound(task_name.to_string()));
        }

        self.auto_commit(&worktree_path, "WIP: before rebase").await?;

        let output = Command::new("git")
            .args(["rebase", &self.config.base_branch])
            .current_dir(&worktree_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let _ = Command::new("git").args(["rebase", "--abort"]).current_dir(&worktree_path).output().await;
            return Err(WorktreeError::RebaseConflict(task_name.to_string()));
        }

        info!(%task_name, "WorktreeManager::rebase: succeeded");
        Ok(())
    }

    async fn auto_commit(&self, worktree_path: &Path, message: &str) -> Result<(), WorktreeError> {
        let status_output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if status_output.stdout.is_empty() {
            return Ok(());
        }

        let _ = Command::new("git").args(["add", "-A"]).current_dir(worktree_path).output().await;
        let _ = Command::new("git")
            .args(["commit", "-m", message, "--allow-empty"])
            .current_dir(worktree_path)
            .output()
            .await;
        Ok(())
    }

    pub async fn validate(&self, task_name: &str) -> Result<(), WorktreeError> {
        let worktree_path = self.worktree_path(task_name);
        if !worktree_path.exists() {
            return Err(WorktreeError::NotFound(task_name.to_string()));
        }

        let output = Command::new("git")
            .args(["status"])
            .current_dir(&worktree_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            return Err(WorktreeError::Corrupted(task_name.to_string()));
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let mut worktrees = Vec::new();
        if !self.config.base_dir.exists() {
            return Ok(worktrees);
        }

        let mut entries = tokio::fs::read_dir(&self.config.base_dir).await.context("failed to read worktrees directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                let task_name = path.file_name().unwrap().to_str().unwrap().to_string();
                let branch = format!("{}/{}", self.config.branch_prefix, task_name);
                worktrees.push(WorktreeInfo { task_name, path, branch });
            }
        }
        Ok(worktrees)
    }

    pub fn worktree_path(&self, task_name: &str) -> PathBuf {
        self.config.base_dir.join(task_name)
    }

    pub fn exists(&self, task_name: &str) -> bool {
        self.worktree_path(task_name).exists()
    }
}
