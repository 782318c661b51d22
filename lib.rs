//! TAKT — multi-agent piece orchestration runtime
//!
//! # Modules
//!
//! - [`domain`] — shared primitives (permission modes, IDs)
//! - [`response`] — the agent response envelope
//! - [`piece`] — piece/movement model, loading, and normalization
//! - [`facet`] — persona/policy/knowledge/instruction resolution
//! - [`instruction`] — phase prompt assembly
//! - [`provider`] — the abstract provider contract
//! - [`rule`] — rule evaluation and the five-stage fallback
//! - [`session`] — worktree-scoped session continuity
//! - [`events`] — the NDJSON session-log sink
//! - [`engine`] — the piece engine and its movement-kind variants
//! - [`task`] — the task manifest and task records
//! - [`worktree`] — isolated working trees
//! - [`scheduler`] — the bounded worker pool
//! - [`config`] — layered configuration
//! - [`cli`] — the command-line surface

#![allow(dead_code)]

pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod events;
pub mod facet;
pub mod instruction;
pub mod piece;
pub mod provider;
pub mod response;
pub mod rule;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod worktree;

pub use config::Config;
pub use engine::{EngineOptions, ExecutionState, PieceEngine, RunStatus};
pub use piece::{Piece, PieceLoader};
pub use provider::{AgentRunner, Provider};
pub use response::{Response, ResponseStatus};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use task::{TaskManifest, TaskRecord, TaskStatus};
pub use worktree::{WorktreeConfig, WorktreeManager};
