//! Task scheduler (§4.6)
//!
//! A bounded worker pool that polls the manifest for pending work. Each
//! worker is independent: it claims a task, builds and runs a piece engine
//! inside that task's worktree, and transitions the record on completion.
//! No priority, no rate limiting — FIFO only.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::engine::{EngineOptions, PieceEngine, RunStatus};
use crate::events::Sink;
use crate::facet::FacetStore;
use crate::piece::PieceLoader;
use crate::provider::Provider;
use crate::session::SessionRegistry;
use crate::task::TaskManifest;
use crate::worktree::WorktreeManager;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size; default 1 means tasks run strictly one at a time.
    pub concurrency: usize,
    pub task_poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            task_poll_interval_ms: 2_000,
        }
    }
}

/// Everything a worker needs to turn a claimed [`crate::task::TaskRecord`]
/// into a running [`PieceEngine`].
pub struct Scheduler {
    config: SchedulerConfig,
    manifest: Arc<TaskManifest>,
    worktrees: Arc<WorktreeManager>,
    loader: Arc<PieceLoader>,
    provider: Arc<dyn Provider>,
    facets: Arc<FacetStore>,
    sessions: Arc<SessionRegistry>,
    sink: Arc<dyn Sink>,
    engine_options_for: Arc<dyn Fn() -> EngineOptions + Send + Sync>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        manifest: Arc<TaskManifest>,
        worktrees: Arc<WorktreeManager>,
        loader: Arc<PieceLoader>,
        provider: Arc<dyn Provider>,
        facets: Arc<FacetStore>,
        sessions: Arc<SessionRegistry>,
        sink: Arc<dyn Sink>,
        engine_options_for: Arc<dyn Fn() -> EngineOptions + Send + Sync>,
    ) -> Self {
        Self {
            config,
            manifest,
            worktrees,
            loader,
            provider,
            facets,
            sessions,
            sink,
            engine_options_for,
        }
    }

    /// Spawn `concurrency` workers and wait for them all to exit. `abort`
    /// is shared by every worker and every piece engine a worker runs;
    /// cancelling it (e.g. on SIGINT) stops new claims and propagates into
    /// any in-flight run.
    pub async fn run(self: Arc<Self>, abort: CancellationToken) {
        info!(concurrency = self.config.concurrency, "Scheduler::run: starting worker pool");
        let prefixed = self.config.concurrency > 1;

        let handles: Vec<_> = (0..self.config.concurrency.max(1))
            .map(|worker_id| {
                let scheduler = Arc::clone(&self);
                let abort = abort.clone();
                tokio::spawn(async move { scheduler.worker_loop(worker_id, prefixed, abort).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler::run: worker panicked");
            }
        }
        info!("Scheduler::run: all workers exited");
    }

    async fn worker_loop(&self, worker_id: usize, prefixed: bool, abort: CancellationToken) {
        loop {
            if abort.is_cancelled() {
                info!(worker_id, "Scheduler::worker_loop: abort requested, exiting");
                return;
            }

            let claimed = match self.manifest.claim_next_pending().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(worker_id, error = %e, "Scheduler::worker_loop: claim failed");
                    tokio::time::sleep(Duration::from_millis(self.config.task_poll_interval_ms)).await;
                    continue;
                }
            };

            let Some(task) = claimed else {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.task_poll_interval_ms)) => {}
                    _ = abort.cancelled() => {}
                }
                continue;
            };

            let span = info_span!("task", name = %task.name);
            let label = if prefixed { format!("[{}] ", task.name) } else { String::new() };
            self.run_task(&task.name, &task.content, &task.piece, &label, abort.clone()).instrument(span).await;
        }
    }

    async fn run_task(&self, name: &str, content: &str, piece_ref: &str, label: &str, abort: CancellationToken) {
        info!("{label}claiming worktree");
        let worktree = match self.worktrees.create_or_reuse(name).await {
            Ok(wt) => wt,
            Err(e) => {
                error!("{label}failed to create worktree: {e}");
                let _ = self.manifest.error_task(name).await;
                return;
            }
        };
        if let Err(e) = self.manifest.bind_worktree(name, worktree.branch.clone(), worktree.path.clone()).await {
            warn!("{label}failed to record worktree binding: {e}");
        }

        let piece = match self.loader.load(piece_ref) {
            Ok(piece) => Arc::new(piece),
            Err(e) => {
                error!("{label}failed to load piece `{piece_ref}`: {e}");
                let _ = self.manifest.error_task(name).await;
                return;
            }
        };

        let mut engine = PieceEngine::new(
            piece,
            Arc::clone(&self.provider),
            Arc::clone(&self.facets),
            Arc::clone(&self.sessions),
            Arc::clone(&self.sink),
            worktree.path.clone(),
            content.to_string(),
            (self.engine_options_for)(),
            abort,
        );

        let state = engine.run().await;
        match state.status {
            RunStatus::Completed => {
                info!("{label}completed");
                let _ = self.manifest.complete_task(name).await;
                if let Err(e) = self.worktrees.remove(name).await {
                    warn!("{label}worktree cleanup failed: {e}");
                }
            }
            RunStatus::Failed | RunStatus::Aborted => {
                warn!(reason = ?state.reason, "{label}did not complete");
                let _ = self.manifest.fail_task(name).await;
            }
            RunStatus::Running => {
                unreachable!("PieceEngine::run never returns while still Running")
            }
        }
    }
}

