//! Task record (§3, §4.6)
//!
//! One `TaskRecord` is one row of the manifest: a unit of work bound to a
//! piece, a branch, and (once claimed) a worktree.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
}

impl TaskStatus {
    /// `failed` and `error` tasks may be requeued; `completed` tasks may be
    /// re-executed; `pending` is the only status `claimNextPending` admits.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Error)
    }
}

/// One task in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub content: String,
    pub status: TaskStatus,
    pub piece: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_pr: bool,
    #[serde(default)]
    pub issue: Option<u64>,
    /// Relative path under `.takt/` where this task's ordering/priority
    /// metadata lives, if the scheduler assigns one.
    #[serde(default)]
    pub order_path: Option<PathBuf>,
}

impl TaskRecord {
    pub fn new(name: impl Into<String>, content: impl Into<String>, piece: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            status: TaskStatus::Pending,
            piece: piece.into(),
            branch: None,
            worktree_path: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            auto_pr: false,
            issue: None,
            order_path: None,
        }
    }
}
