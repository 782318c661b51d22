//! Task manifest (§4.6)
//!
//! A single YAML file (`.takt/tasks.yaml`) is the entire durable record of
//! every task. Every mutation holds an in-memory [`tokio::sync::Mutex`] for
//! the duration of the read-modify-write, then persists by writing to a
//! sibling temp file and renaming over the manifest — a crash can never
//! leave a half-written file behind.

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::record::{TaskRecord, TaskStatus};

#[derive(Debug, Error)]
pub enum TaskManifestError {
    #[error("failed to read manifest at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no task named `{0}` in the manifest")]
    NotFound(String),

    #[error("task `{0}` already exists")]
    AlreadyExists(String),

    #[error("task `{0}` is `{1:?}`, expected `{2:?}`")]
    WrongStatus(String, TaskStatus, TaskStatus),
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct ManifestFile {
    #[serde(default)]
    tasks: Vec<TaskRecord>,
}

/// Owns the manifest file and every in-process mutation against it.
pub struct TaskManifest {
    path: PathBuf,
    tasks: Mutex<Vec<TaskRecord>>,
}

impl TaskManifest {
    /// Load `.takt/tasks.yaml` at `path`, creating an empty manifest if it
    /// doesn't exist yet.
    pub async fn load(path: PathBuf) -> Result<Self, TaskManifestError> {
        debug!(?path, "TaskManifest::load: called");
        let tasks = if path.is_file() {
            let text = std::fs::read_to_string(&path).map_err(|source| TaskManifestError::Io { path: path.clone(), source })?;
            let file: ManifestFile = serde_yaml::from_str(&text).map_err(|source| TaskManifestError::Parse { path: path.clone(), source })?;
            file.tasks
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    fn persist(&self, tasks: &[TaskRecord]) -> Result<(), TaskManifestError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TaskManifestError::Io { path: self.path.clone(), source })?;
        }
        let file = ManifestFile { tasks: tasks.to_vec() };
        let text = serde_yaml::to_string(&file).expect("ManifestFile is always serializable");
        let tmp_path = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &text).map_err(|source| TaskManifestError::Io { path: tmp_path.clone(), source })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| TaskManifestError::Io { path: self.path.clone(), source })?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<TaskRecord> {
        self.tasks.lock().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<TaskRecord> {
        self.tasks.lock().await.iter().find(|t| t.name == name).cloned()
    }

    /// Append a new `pending` task. Fails if a task with this name already
    /// exists.
    pub async fn add_task(&self, name: impl Into<String>, content: impl Into<String>, piece: impl Into<String>) -> Result<TaskRecord, TaskManifestError> {
        let name = name.into();
        debug!(%name, "TaskManifest::add_task: called");
        let mut tasks = self.tasks.lock().await;
        if tasks.iter().any(|t| t.name == name) {
            return Err(TaskManifestError::AlreadyExists(name));
        }
        let record = TaskRecord::new(name, content, piece, Utc::now());
        tasks.push(record.clone());
        self.persist(&tasks)?;
        info!(name = %record.name, "TaskManifest::add_task: added");
        Ok(record)
    }

    /// Atomically claim the oldest `pending` task and transition it to
    /// `running` (FIFO — no priority queue). The caller binds the worktree
    /// afterward via [`Self::bind_worktree`], once it knows the claimed
    /// task's name.
    pub async fn claim_next_pending(&self) -> Result<Option<TaskRecord>, TaskManifestError> {
        debug!("TaskManifest::claim_next_pending: called");
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.iter_mut().find(|t| t.status == TaskStatus::Pending) else {
            return Ok(None);
        };
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let claimed = task.clone();
        self.persist(&tasks)?;
        info!(name = %claimed.name, "TaskManifest::claim_next_pending: claimed");
        Ok(Some(claimed))
    }

    /// Record the branch and worktree path a claimed task is running in.
    pub async fn bind_worktree(&self, name: &str, branch: impl Into<String>, worktree_path: PathBuf) -> Result<(), TaskManifestError> {
        debug!(%name, "TaskManifest::bind_worktree: called");
        let mut tasks = self.tasks.lock().await;
        let task = tasks.iter_mut().find(|t| t.name == name).ok_or_else(|| TaskManifestError::NotFound(name.to_string()))?;
        task.branch = Some(branch.into());
        task.worktree_path = Some(worktree_path);
        self.persist(&tasks)?;
        Ok(())
    }

    pub async fn complete_task(&self, name: &str) -> Result<TaskRecord, TaskManifestError> {
        debug!(%name, "TaskManifest::complete_task: called");
        self.transition(name, TaskStatus::Running, TaskStatus::Completed, |t| {
            t.completed_at = Some(Utc::now());
        })
        .await
    }

    pub async fn fail_task(&self, name: &str) -> Result<TaskRecord, TaskManifestError> {
        debug!(%name, "TaskManifest::fail_task: called");
        self.transition(name, TaskStatus::Running, TaskStatus::Failed, |t| {
            t.completed_at = Some(Utc::now());
        })
        .await
    }

    /// Transition to `error` (§7): an infra/collaborator-level failure
    /// (worktree creation, piece load) rather than a clean piece abort.
    pub async fn error_task(&self, name: &str) -> Result<TaskRecord, TaskManifestError> {
        debug!(%name, "TaskManifest::error_task: called");
        self.transition(name, TaskStatus::Running, TaskStatus::Error, |t| {
            t.completed_at = Some(Utc::now());
        })
        .await
    }

    /// Return a `failed`/`error` task to `pending` so the scheduler picks it
    /// up again.
    pub async fn requeue_task(&self, name: &str) -> Result<TaskRecord, TaskManifestError> {
        debug!(%name, "TaskManifest::requeue_task: called");
        let mut tasks = self.tasks.lock().await;
        let task = tasks.iter_mut().find(|t| t.name == name).ok_or_else(|| TaskManifestError::NotFound(name.to_string()))?;
        if !task.status.is_terminal() {
            return Err(TaskManifestError::WrongStatus(name.to_string(), task.status, TaskStatus::Failed));
        }
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.completed_at = None;
        let updated = task.clone();
        self.persist(&tasks)?;
        warn!(name = %updated.name, "TaskManifest::requeue_task: requeued");
        Ok(updated)
    }

    /// Drop a `completed` task from the manifest entirely.
    pub async fn delete_completed_task(&self, name: &str) -> Result<(), TaskManifestError> {
        debug!(%name, "TaskManifest::delete_completed_task: called");
        let mut tasks = self.tasks.lock().await;
        let index = tasks.iter().position(|t| t.name == name).ok_or_else(|| TaskManifestError::NotFound(name.to_string()))?;
        if tasks[index].status != TaskStatus::Completed {
            return Err(TaskManifestError::WrongStatus(name.to_string(), tasks[index].status, TaskStatus::Completed));
        }
        tasks.remove(index);
        self.persist(&tasks)?;
        Ok(())
    }

    /// Re-run a `completed`/`failed` task: moves it directly to `running`,
    /// bypassing `pending`, so a concurrent `claim_next_pending` in another
    /// worker can never race to pick it up.
    pub async fn start_re_execution(&self, name: &str) -> Result<TaskRecord, TaskManifestError> {
        debug!(%name, "TaskManifest::start_re_execution: called");
        let mut tasks = self.tasks.lock().await;
        let task = tasks.iter_mut().find(|t| t.name == name).ok_or_else(|| TaskManifestError::NotFound(name.to_string()))?;
        if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            return Err(TaskManifestError::WrongStatus(name.to_string(), task.status, TaskStatus::Completed));
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.completed_at = None;
        task.worktree_path = None;
        let updated = task.clone();
        self.persist(&tasks)?;
        info!(name = %updated.name, "TaskManifest::start_re_execution: re-executing");
        Ok(updated)
    }

    async fn transition(&self, name: &str, from: TaskStatus, to: TaskStatus, mutate: impl FnOnce(&mut TaskRecord)) -> Result<TaskRecord, TaskManifestError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.iter_mut().find(|t| t.name == name).ok_or_else(|| TaskManifestError::NotFound(name.to_string()))?;
        if task.status != from {
            return Err(TaskManifestError::WrongStatus(name.to_string(), task.status, from));
        }
        task.status = to;
        mutate(task);
        let updated = task.clone();
        self.persist(&tasks)?;
        Ok(updated)
    }
}
