//! Piece engine (§4.5)
//!
//! Drives one [`Piece`] from its initial movement to a terminal status,
//! dispatching each movement according to its kind and following the rule
//! evaluator's verdict. One `PieceEngine` instance owns exactly one
//! [`ExecutionState`] for the lifetime of one run.

mod variants;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::PermissionMode;
use crate::events::{Event, Phase as EventPhase, Sink};
use crate::facet::FacetStore;
use crate::instruction::InstructionBuilder;
use crate::piece::{Movement, NextMovement, Piece, Terminal};
use crate::provider::Provider;
use crate::response::{Response, ResponseStatus};
use crate::rule::RuleEvaluator;
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub movement: String,
    pub phase: EventPhase,
    pub response: Response,
}

/// Mutable state threaded through one piece run (§3).
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub current_movement: String,
    pub iteration: u32,
    pub movement_iteration: HashMap<String, u32>,
    pub report_dir: Option<PathBuf>,
    pub status: RunStatus,
    pub previous_output: Option<Response>,
    pub user_inputs: Vec<String>,
    pub history: Vec<HistoryEntry>,
    pub reason: Option<String>,
}

impl ExecutionState {
    fn new(initial_movement: &str) -> Self {
        Self {
            current_movement: initial_movement.to_string(),
            iteration: 0,
            movement_iteration: HashMap::new(),
            report_dir: None,
            status: RunStatus::Running,
            previous_output: None,
            user_inputs: Vec::new(),
            history: Vec::new(),
            reason: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Configurable regex identifying "fix" movements for cycle detection.
    pub ai_fix_pattern: Regex,
    /// Configurable regex identifying "review" movements for cycle detection.
    pub ai_review_pattern: Regex,
    /// Rounds a `(review, fix)` fingerprint pair may repeat before the
    /// engine forces an arbitration transition (Open Question: default 3).
    pub cycle_window: usize,
    /// Movement to force a transition to when a cycle is detected, if any;
    /// falls back to `ABORT` when absent.
    pub arbitration_movement: Option<String>,
    pub language: String,
    /// `(provider_name, movement_name, floor) -> resolved mode` (§6 five-level
    /// resolution); see [`crate::config::Config::permission_resolver`].
    pub permission_mode_resolver: Arc<dyn Fn(&str, &str, PermissionMode) -> PermissionMode + Send + Sync>,
    /// Whether this run has a human attending it; interactive-only rules
    /// (§3) are skipped when `false`.
    pub interactive: bool,
}

impl EngineOptions {
    /// Permission mode floored, never resolved above the movement's own
    /// requirement (§6 resolution order item 5 is always applied last).
    pub fn default_ai_fix_pattern() -> Regex {
        Regex::new(r"(?i)ai[_-]?fix").expect("static pattern is valid")
    }

    pub fn default_ai_review_pattern() -> Regex {
        Regex::new(r"(?i)ai[_-]?review").expect("static pattern is valid")
    }
}

/// A bounded window of recently-seen `(review_fingerprint, fix_fingerprint)`
/// pairs, per-piece-run (§4.5 cycle detection).
struct CycleDetector {
    window: usize,
    seen: std::collections::VecDeque<(u64, u64)>,
    last_review_fingerprint: Option<u64>,
}

impl CycleDetector {
    fn new(window: usize) -> Self {
        Self {
            window,
            seen: std::collections::VecDeque::new(),
            last_review_fingerprint: None,
        }
    }

    fn note_review(&mut self, response: &Response) {
        self.last_review_fingerprint = Some(fingerprint(&response.content));
    }

    /// Returns `true` if entering a fix movement with `response` repeats a
    /// `(review, fix)` pair seen within the last `window` rounds.
    fn check_fix(&mut self, response: &Response) -> bool {
        let Some(review_fp) = self.last_review_fingerprint else {
            return false;
        };
        let fix_fp = fingerprint(&response.content);
        let pair = (review_fp, fix_fp);
        let repeated = self.seen.contains(&pair);
        self.seen.push_back(pair);
        while self.seen.len() > self.window {
            self.seen.pop_front();
        }
        repeated
    }
}

/// Stable hash over whitespace-normalized content.
fn fingerprint(content: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let normalized: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

pub struct PieceEngine {
    piece: Arc<Piece>,
    provider: Arc<dyn Provider>,
    facets: Arc<FacetStore>,
    instructions: InstructionBuilder,
    rules: RuleEvaluator,
    sessions: Arc<SessionRegistry>,
    sink: Arc<dyn Sink>,
    cwd: PathBuf,
    task_text: String,
    options: EngineOptions,
    abort: CancellationToken,
    cycles: CycleDetector,
}

impl PieceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        piece: Arc<Piece>,
        provider: Arc<dyn Provider>,
        facets: Arc<FacetStore>,
        sessions: Arc<SessionRegistry>,
        sink: Arc<dyn Sink>,
        cwd: PathBuf,
        task_text: String,
        options: EngineOptions,
        abort: CancellationToken,
    ) -> Self {
        let cycle_window = options.cycle_window;
        Self {
            piece,
            provider,
            facets,
            instructions: InstructionBuilder::new(),
            rules: RuleEvaluator::new(),
            sessions,
            sink,
            cwd,
            task_text,
            options,
            abort,
            cycles: CycleDetector::new(cycle_window),
        }
    }

    pub async fn run(&mut self) -> ExecutionState {
        let mut state = ExecutionState::new(&self.piece.initial_movement);
        info!(piece = %self.piece.name, "PieceEngine::run: called");
        let _ = self.sink.emit(Event::PieceStart { piece: self.piece.name.clone() });

        loop {
            if self.abort.is_cancelled() {
                info!(piece = %self.piece.name, "PieceEngine::run: abort requested");
                state.status = RunStatus::Aborted;
                break;
            }

            state.iteration += 1;
            if state.iteration > self.piece.max_movements {
                warn!(piece = %self.piece.name, "PieceEngine::run: max_movements reached");
                state.status = RunStatus::Failed;
                state.reason = Some("max_movements_reached".to_string());
                break;
            }

            let Some(movement) = self.piece.movement(&state.current_movement) else {
                error!(piece = %self.piece.name, movement = %state.current_movement, "PieceEngine::run: movement vanished mid-run");
                state.status = RunStatus::Failed;
                state.reason = Some("movement_not_found".to_string());
                break;
            };
            let movement = movement.clone();

            *state.movement_iteration.entry(movement.name().to_string()).or_insert(0) += 1;
            let _ = self.sink.emit(Event::MovementStart { movement: movement.name().to_string() });

            match self.execute_movement(&movement, &mut state).await {
                Ok(MovementOutcome::Terminal(status, reason)) => {
                    state.status = status;
                    state.reason = reason;
                    break;
                }
                Ok(MovementOutcome::Next(name)) => {
                    state.current_movement = name;
                }
                Err(EngineFailure { reason }) => {
                    state.status = RunStatus::Failed;
                    state.reason = Some(reason);
                    break;
                }
            }

            let _ = self.sink.emit(Event::MovementComplete { movement: movement.name().to_string() });
        }

        let status_label = match state.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Running => "running",
        };
        if state.status == RunStatus::Aborted {
            let _ = self.sink.emit(Event::PieceAbort {
                reason: state.reason.clone().unwrap_or_default(),
            });
        } else {
            let _ = self.sink.emit(Event::PieceComplete {
                status: status_label.to_string(),
            });
        }
        info!(piece = %self.piece.name, status = status_label, "PieceEngine::run: finished");
        state
    }

    async fn execute_movement(&mut self, movement: &Movement, state: &mut ExecutionState) -> Result<MovementOutcome, EngineFailure> {
        debug!(movement = movement.name(), "PieceEngine::execute_movement: called");

        if self.options.ai_fix_pattern.is_match(movement.name()) {
            // Cycle detection happens once we have the movement's own
            // response, below.
        }

        let dispatch = variants::dispatch(self, movement, state).await?;

        if self.options.ai_review_pattern.is_match(movement.name()) {
            self.cycles.note_review(&dispatch.primary_response);
        }
        if self.options.ai_fix_pattern.is_match(movement.name()) && self.cycles.check_fix(&dispatch.primary_response) {
            warn!(movement = movement.name(), "PieceEngine::execute_movement: cycle detected");
            return Ok(match &self.options.arbitration_movement {
                Some(name) => MovementOutcome::Next(name.clone()),
                None => MovementOutcome::Terminal(RunStatus::Failed, Some("cycle_detected".to_string())),
            });
        }

        state.previous_output = Some(dispatch.primary_response.clone());
        if dispatch.sub_history.is_empty() {
            state.history.push(HistoryEntry {
                movement: movement.name().to_string(),
                phase: EventPhase::One,
                response: dispatch.primary_response.clone(),
            });
        } else {
            // Parallel/team-leader movements record one entry per
            // sub-movement/part, in configured order, instead of the
            // single combined response (§4.5, §8).
            for (name, response) in &dispatch.sub_history {
                state.history.push(HistoryEntry {
                    movement: name.clone(),
                    phase: EventPhase::One,
                    response: response.clone(),
                });
            }
        }

        if dispatch.primary_response.is_error() {
            warn!(movement = movement.name(), "PieceEngine::execute_movement: phase1 error, skipping phase2/3");
            return Ok(MovementOutcome::Terminal(RunStatus::Failed, Some(dispatch.primary_response.content.clone())));
        }

        let rule_match = variants::evaluate_rules(self, movement, &dispatch).await.map_err(|e| EngineFailure {
            reason: e.to_string(),
        })?;

        let rule = &movement.rules()[rule_match.rule_index];
        let _ = self.sink.emit(Event::MovementPhase {
            movement: movement.name().to_string(),
            phase: EventPhase::Three,
            match_method: Some(rule_match.method.log_label().to_string()),
        });

        match &rule.next {
            NextMovement::Terminal(Terminal::Complete) => Ok(MovementOutcome::Terminal(RunStatus::Completed, None)),
            NextMovement::Terminal(Terminal::Abort) => Ok(MovementOutcome::Terminal(RunStatus::Failed, Some("rule_abort".to_string()))),
            NextMovement::Named(name) => Ok(MovementOutcome::Next(name.clone())),
        }
    }

    pub(crate) fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    pub(crate) fn task_text(&self) -> &str {
        &self.task_text
    }

    pub(crate) fn abort_signal(&self) -> CancellationToken {
        self.abort.clone()
    }
}

struct EngineFailure {
    reason: String,
}

enum MovementOutcome {
    Terminal(RunStatus, Option<String>),
    Next(String),
}

pub(crate) struct DispatchResult {
    pub primary_response: Response,
    pub phase3_response: Option<Response>,
    pub sub_outcomes: Vec<crate::rule::SubMovementOutcome>,
    /// One `(sub-movement name, phase1 response)` pair per sub-movement/part,
    /// in configured order; empty for `Single`/`Arpeggio` movements, which
    /// record only `primary_response` under their own movement name.
    pub sub_history: Vec<(String, Response)>,
}

impl DispatchResult {
    pub(crate) fn single(response: Response) -> Self {
        Self {
            primary_response: response,
            phase3_response: None,
            sub_outcomes: Vec::new(),
            sub_history: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facet::FacetStore;
    use crate::piece::{MovementCommon, ProviderOptions, Rule, RuleKind};
    use crate::provider::{MockProvider, MockTurn};
    use tempfile::tempdir;

    fn single_movement_piece(rules: Vec<Rule>, name: &str) -> Piece {
        let common = MovementCommon {
            name: name.to_string(),
            description: None,
            allowed_tools: vec![],
            required_permission_mode: PermissionMode::Readonly,
            provider: None,
            model: None,
            edit: false,
            pass_previous_response: false,
            instruction_template: "go".into(),
            output_contracts: vec![],
            persona_ref: None,
            policy_refs: vec![],
            knowledge_refs: vec![],
            report_spec: None,
            rules,
            structured_output_schema_ref: None,
            structured_output_schema: None,
        };
        Piece {
            name: "demo".into(),
            description: None,
            max_movements: 5,
            initial_movement: name.to_string(),
            movements: vec![Movement::Single { common }],
            provider_options: ProviderOptions::default(),
            runtime_prepare: None,
            min_version: None,
        }
    }

    fn options() -> EngineOptions {
        EngineOptions {
            ai_fix_pattern: EngineOptions::default_ai_fix_pattern(),
            ai_review_pattern: EngineOptions::default_ai_review_pattern(),
            cycle_window: 3,
            arbitration_movement: None,
            language: "en".into(),
            permission_mode_resolver: Arc::new(|_, _, floor| floor),
            interactive: false,
        }
    }

    fn facets(dir: &std::path::Path) -> Arc<FacetStore> {
        Arc::new(FacetStore::new(None, None, dir.to_path_buf()))
    }

    #[tokio::test]
    async fn run_completes_on_terminal_rule() {
        let piece = Arc::new(single_movement_piece(
            vec![Rule {
                condition: "done".into(),
                next: NextMovement::Terminal(Terminal::Complete),
                kind: RuleKind::Tag,
                ordinal: 1,
                interactive_only: false,
                appendix_template: None,
            }],
            "work",
        ));
        let provider = Arc::new(MockProvider::new(vec![MockTurn {
            content: "all good".into(),
            status: ResponseStatus::Done,
            structured_output: None,
        }]));
        let builtin = tempdir().unwrap();
        let sessions_dir = tempdir().unwrap();
        let mut engine = PieceEngine::new(
            piece,
            provider,
            facets(builtin.path()),
            Arc::new(SessionRegistry::new(sessions_dir.path().to_path_buf())),
            Arc::new(crate::events::VecSink::new()),
            std::env::temp_dir(),
            "do the thing".into(),
            options(),
            CancellationToken::new(),
        );
        let state = engine.run().await;
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn run_fails_when_max_movements_reached_before_rule_can_terminate() {
        let common = MovementCommon {
            name: "loop".into(),
            description: None,
            allowed_tools: vec![],
            required_permission_mode: PermissionMode::Readonly,
            provider: None,
            model: None,
            edit: false,
            pass_previous_response: false,
            instruction_template: "go".into(),
            output_contracts: vec![],
            persona_ref: None,
            policy_refs: vec![],
            knowledge_refs: vec![],
            report_spec: None,
            rules: vec![Rule {
                condition: "again".into(),
                next: NextMovement::Named("loop".into()),
                kind: RuleKind::Tag,
                ordinal: 1,
                interactive_only: false,
                appendix_template: None,
            }],
            structured_output_schema_ref: None,
            structured_output_schema: None,
        };
        let piece = Arc::new(Piece {
            name: "demo".into(),
            description: None,
            max_movements: 2,
            initial_movement: "loop".into(),
            movements: vec![Movement::Single { common }],
            provider_options: ProviderOptions::default(),
            runtime_prepare: None,
            min_version: None,
        });
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn { content: "keep going".into(), status: ResponseStatus::Done, structured_output: None },
            MockTurn { content: "keep going".into(), status: ResponseStatus::Done, structured_output: None },
            MockTurn { content: "keep going".into(), status: ResponseStatus::Done, structured_output: None },
        ]));
        let builtin = tempdir().unwrap();
        let sessions_dir = tempdir().unwrap();
        let mut engine = PieceEngine::new(
            piece,
            provider,
            facets(builtin.path()),
            Arc::new(SessionRegistry::new(sessions_dir.path().to_path_buf())),
            Arc::new(crate::events::VecSink::new()),
            std::env::temp_dir(),
            "task".into(),
            options(),
            CancellationToken::new(),
        );
        let state = engine.run().await;
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.reason.as_deref(), Some("max_movements_reached"));
    }

    #[tokio::test]
    async fn run_aborts_immediately_when_cancellation_already_requested() {
        let piece = Arc::new(single_movement_piece(
            vec![Rule {
                condition: "done".into(),
                next: NextMovement::Terminal(Terminal::Complete),
                kind: RuleKind::Tag,
                ordinal: 1,
                interactive_only: false,
                appendix_template: None,
            }],
            "work",
        ));
        let provider = Arc::new(MockProvider::new(vec![]));
        let builtin = tempdir().unwrap();
        let sessions_dir = tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut engine = PieceEngine::new(
            piece,
            provider,
            facets(builtin.path()),
            Arc::new(SessionRegistry::new(sessions_dir.path().to_path_buf())),
            Arc::new(crate::events::VecSink::new()),
            std::env::temp_dir(),
            "task".into(),
            options(),
            token,
        );
        let state = engine.run().await;
        assert_eq!(state.status, RunStatus::Aborted);
    }

    #[test]
    fn cycle_detector_flags_repeated_review_fix_pair_within_window() {
        let mut detector = CycleDetector::new(3);
        let review = Response::done("same review text", "t");
        let fix = Response::done("same fix text", "t");
        detector.note_review(&review);
        assert!(!detector.check_fix(&fix));
        detector.note_review(&review);
        assert!(detector.check_fix(&fix));
    }

    #[test]
    fn cycle_detector_window_expires_old_pairs() {
        let mut detector = CycleDetector::new(1);
        let review = Response::done("r", "t");
        let fix = Response::done("f", "t");
        detector.note_review(&review);
        assert!(!detector.check_fix(&fix));
        detector.note_review(&Response::done("other review", "t"));
        assert!(!detector.check_fix(&Response::done("other fix", "t")));
    }
}
