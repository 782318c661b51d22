//! Movement-kind dispatch (§4.5): single, parallel, team-leader, arpeggio.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::facet::FacetType;
use crate::instruction::IterationContext;
use crate::piece::{Movement, ProviderOptions, ReportSpec};
use crate::provider::{CallOptions, PersonaSpec};
use crate::response::{Response, ResponseStatus};
use crate::rule::{RuleError, RuleMatch, SubMovementOutcome};

use super::{DispatchResult, EngineFailure, ExecutionState, PieceEngine};

pub(super) async fn dispatch(engine: &PieceEngine, movement: &Movement, state: &ExecutionState) -> Result<DispatchResult, EngineFailure> {
    match movement {
        Movement::Single { .. } => run_single(engine, movement, state).await,
        Movement::Parallel { sub_movements, .. } => run_parallel(engine, movement, sub_movements, state).await,
        Movement::TeamLeader { .. } => run_team_leader(engine, movement, state).await,
        Movement::Arpeggio { .. } => run_arpeggio(engine, movement, state).await,
    }
}

pub(super) async fn evaluate_rules(engine: &PieceEngine, movement: &Movement, dispatch: &DispatchResult) -> Result<RuleMatch, RuleError> {
    if matches!(movement, Movement::Parallel { .. } | Movement::TeamLeader { .. }) {
        return engine
            .rules
            .evaluate_aggregate(movement, &dispatch.sub_outcomes, engine.options.interactive)
            .ok_or_else(|| RuleError::NoMatch(movement.name().to_string()));
    }

    let phase1 = &dispatch.primary_response;
    let phase3 = dispatch.phase3_response.as_ref();
    engine.rules.evaluate(movement, phase1, phase3, None, None, engine.options.interactive).await
}

/// Run the full phase1(+2+3) pipeline for a movement that issues exactly one
/// agent invocation (a `Single`, or one `Parallel` sub-movement).
async fn execute_single_pipeline(
    engine: &PieceEngine,
    movement: &Movement,
    state: &ExecutionState,
    movement_index: usize,
    movement_count: usize,
) -> Result<(Response, Option<Response>), EngineFailure> {
    let common = movement.common();
    debug!(movement = movement.name(), "variants::execute_single_pipeline: called");

    let report_dir = if common.report_spec.is_some() {
        Some(report_dir_for(engine, movement))
    } else {
        None
    };
    let policy_knowledge_text = resolve_policy_knowledge(engine, movement);

    let ctx = IterationContext {
        working_dir: engine.cwd(),
        task_text: engine.task_text(),
        user_inputs: &state.user_inputs,
        previous_response: state.previous_output.as_ref().map(|r| r.content.as_str()),
        movement_index,
        movement_count,
        iteration: state.iteration,
        max_movements: engine.piece.max_movements,
        movement_iteration: *state.movement_iteration.get(movement.name()).unwrap_or(&1),
        report_dir: report_dir.as_deref(),
        policy_knowledge_text: &policy_knowledge_text,
        language: &engine.options.language,
    };

    let prompt = engine.instructions.phase1(movement, &ctx).map_err(|e| EngineFailure { reason: e.to_string() })?;
    let permission_mode = resolve_permission_mode(engine, movement);
    let phase1_response = call_agent(engine, movement, &prompt, permission_mode).await?;

    if phase1_response.is_error() {
        return Ok((phase1_response, None));
    }

    if common.report_spec.is_some() {
        let phase2_prompt = engine.instructions.phase2(movement, &ctx).map_err(|e| EngineFailure { reason: e.to_string() })?;
        let phase2_response = call_agent(engine, movement, &phase2_prompt, permission_mode).await?;
        if phase2_response.is_error() {
            warn!(movement = movement.name(), "variants::execute_single_pipeline: phase2 errored, retrying once");
            let retry = call_agent(engine, movement, &phase2_prompt, permission_mode).await?;
            if retry.is_error() {
                return Err(EngineFailure {
                    reason: format!("phase2 report generation failed: {}", retry.content),
                });
            }
        }
    }

    let phase3_response = if movement.needs_phase3() {
        let phase3_prompt = engine.instructions.phase3(movement);
        Some(call_agent(engine, movement, &phase3_prompt, permission_mode).await?)
    } else {
        None
    };

    Ok((phase1_response, phase3_response))
}

fn movement_position(engine: &PieceEngine, movement: &Movement) -> usize {
    engine.piece.movements.iter().position(|m| m.name() == movement.name()).unwrap_or(0)
}

async fn run_single(engine: &PieceEngine, movement: &Movement, state: &ExecutionState) -> Result<DispatchResult, EngineFailure> {
    let count = engine.piece.movements.len();
    let index = movement_position(engine, movement);
    let (phase1, phase3) = execute_single_pipeline(engine, movement, state, index, count).await?;
    Ok(DispatchResult {
        primary_response: phase1,
        phase3_response: phase3,
        sub_outcomes: Vec::new(),
        sub_history: Vec::new(),
    })
}

/// Run every sub-movement concurrently, each through its own phase1(+2+3)
/// pipeline and its own (non-aggregate) rule evaluation, then hand the
/// matched condition text of each to the parent's aggregate rule (§4.4
/// stage 1, §4.5).
async fn run_parallel(
    engine: &PieceEngine,
    movement: &Movement,
    sub_movements: &[Movement],
    state: &ExecutionState,
) -> Result<DispatchResult, EngineFailure> {
    debug!(movement = movement.name(), sub_count = sub_movements.len(), "variants::run_parallel: called");
    let count = engine.piece.movements.len();
    let index = movement_position(engine, movement);

    if engine.abort_signal().is_cancelled() {
        return Err(EngineFailure {
            reason: "aborted before parallel sub-movement execution".to_string(),
        });
    }

    let futures = sub_movements.iter().map(|sub| async move {
        let (phase1, phase3) = execute_single_pipeline(engine, sub, state, index, count).await?;
        if phase1.is_error() {
            return Ok::<_, EngineFailure>((sub.name().to_string(), phase1, None::<SubMovementOutcome>));
        }
        let matched_condition = if sub.rules().is_empty() {
            None
        } else {
            match engine.rules.evaluate(sub, &phase1, phase3.as_ref(), None, None, engine.options.interactive).await {
                Ok(m) => Some(sub.rules()[m.rule_index].condition.clone()),
                Err(_) => None,
            }
        };
        Ok((sub.name().to_string(), phase1, Some(SubMovementOutcome { matched_condition })))
    });

    let results = join_all(futures).await;

    let mut combined_content = String::new();
    let mut sub_outcomes = Vec::with_capacity(sub_movements.len());
    let mut sub_history = Vec::with_capacity(sub_movements.len());
    for result in results {
        let (name, phase1, outcome) = result?;
        combined_content.push_str(&phase1.content);
        combined_content.push('\n');
        sub_history.push((name, phase1.clone()));
        match outcome {
            Some(outcome) => sub_outcomes.push(outcome),
            None => {
                return Ok(DispatchResult {
                    primary_response: phase1,
                    phase3_response: None,
                    sub_outcomes,
                    sub_history,
                });
            }
        }
    }

    Ok(DispatchResult {
        primary_response: Response::done(combined_content, "1970-01-01T00:00:00Z"),
        phase3_response: None,
        sub_outcomes,
        sub_history,
    })
}

async fn run_team_leader(engine: &PieceEngine, movement: &Movement, _state: &ExecutionState) -> Result<DispatchResult, EngineFailure> {
    let Movement::TeamLeader { lead_persona_ref, max_parts, timeout_ms, .. } = movement else {
        unreachable!("run_team_leader called with a non-team-leader movement")
    };
    debug!(movement = movement.name(), lead_persona_ref = %lead_persona_ref, max_parts = *max_parts, "variants::run_team_leader: called");

    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "parts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {"title": {"type": "string"}, "instruction": {"type": "string"}},
                    "required": ["title", "instruction"]
                }
            }
        },
        "required": ["parts"]
    });

    let (_, persona_text) = engine
        .facets
        .resolve(FacetType::Persona, lead_persona_ref)
        .map_err(|e| EngineFailure { reason: e.to_string() })?;

    let provider_options = resolve_provider_options(engine, movement);
    let persona = PersonaSpec {
        persona_text,
        provider_override: provider_options.provider.clone(),
        model_override: provider_options.model.clone(),
        output_schema: Some(schema),
    };
    let runner = engine.provider.setup(persona).await.map_err(|e| EngineFailure { reason: e.to_string() })?;
    let permission_mode = resolve_permission_mode(engine, movement);
    let options = CallOptions::new(engine.cwd().clone(), permission_mode).with_abort(engine.abort_signal());
    let lead_prompt = format!("Decompose this task into at most {max_parts} parts: {}", engine.task_text());
    let lead_response = runner.run(&lead_prompt, options.clone()).await.map_err(|e| EngineFailure { reason: e.to_string() })?;

    let parts: Vec<(String, String)> = lead_response
        .structured_output
        .as_ref()
        .and_then(|v| v.get("parts"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|p| {
                    let title = p.get("title")?.as_str()?.to_string();
                    let instruction = p.get("instruction")?.as_str()?.to_string();
                    Some((title, instruction))
                })
                .collect()
        })
        .ok_or_else(|| EngineFailure {
            reason: "team-leader lead response violated the {parts:[...]} schema".to_string(),
        })?;

    if parts.is_empty() || parts.len() as u32 > *max_parts {
        return Err(EngineFailure {
            reason: format!("team-leader produced {} parts, expected 1..={}", parts.len(), max_parts),
        });
    }

    let timeout = std::time::Duration::from_millis(*timeout_ms);
    let futures = parts.into_iter().map(|(title, instruction)| {
        let runner = Arc::clone(&runner);
        let options = options.clone();
        async move {
            match tokio::time::timeout(timeout, runner.run(&instruction, options)).await {
                Ok(Ok(response)) => (title, response),
                Ok(Err(e)) => (title, Response::error(e.to_string(), "1970-01-01T00:00:00Z")),
                Err(_) => (title, Response::error("part timed out", "1970-01-01T00:00:00Z")),
            }
        }
    });
    let results = join_all(futures).await;

    let mut combined_content = String::new();
    let mut sub_outcomes = Vec::with_capacity(results.len());
    let mut sub_history = Vec::with_capacity(results.len());
    for (title, response) in &results {
        combined_content.push_str(&format!("## {title}\n{}\n\n", response.content));
        let matched_condition = match response.status {
            ResponseStatus::Done | ResponseStatus::Answer => Some("done".to_string()),
            ResponseStatus::Blocked => Some("blocked".to_string()),
            ResponseStatus::Error => Some("error".to_string()),
        };
        sub_outcomes.push(SubMovementOutcome { matched_condition });
        sub_history.push((title.clone(), response.clone()));
    }

    Ok(DispatchResult {
        primary_response: Response::done(combined_content, "1970-01-01T00:00:00Z"),
        phase3_response: None,
        sub_outcomes,
        sub_history,
    })
}

async fn run_arpeggio(engine: &PieceEngine, movement: &Movement, _state: &ExecutionState) -> Result<DispatchResult, EngineFailure> {
    let Movement::Arpeggio { csv_source, batch_size, concurrency, .. } = movement else {
        unreachable!("run_arpeggio called with a non-arpeggio movement")
    };
    debug!(movement = movement.name(), csv_source = %csv_source, batch_size = *batch_size, concurrency = *concurrency, "variants::run_arpeggio: called");

    let csv_path = engine.cwd().join(csv_source);
    let text = std::fs::read_to_string(&csv_path).map_err(|e| EngineFailure {
        reason: format!("failed to read arpeggio CSV source {}: {e}", csv_path.display()),
    })?;
    let mut lines = text.lines();
    let header: Vec<String> = lines.next().unwrap_or("").split(',').map(|s| s.trim().to_string()).collect();
    let rows: Vec<Vec<String>> = lines.map(|line| line.split(',').map(|s| s.trim().to_string()).collect()).collect();

    let batches: Vec<&[Vec<String>]> = rows.chunks((*batch_size).max(1) as usize).collect();
    let permits = (*concurrency).max(1) as usize;
    let semaphore = Arc::new(Semaphore::new(permits));

    let permission_mode = resolve_permission_mode(engine, movement);
    let persona_text = match &movement.common().persona_ref {
        Some(name) => engine.facets.resolve(FacetType::Persona, name).map(|(_, t)| t).unwrap_or_default(),
        None => String::new(),
    };
    let provider_options = resolve_provider_options(engine, movement);
    let persona = PersonaSpec {
        persona_text,
        provider_override: provider_options.provider.clone(),
        model_override: provider_options.model.clone(),
        output_schema: None,
    };
    let runner = engine.provider.setup(persona).await.map_err(|e| EngineFailure { reason: e.to_string() })?;
    let call_options = CallOptions::new(engine.cwd().clone(), permission_mode).with_abort(engine.abort_signal());
    let template = movement.common().instruction_template.clone();

    let futures = batches.into_iter().enumerate().map(|(batch_index, batch)| {
        let semaphore = Arc::clone(&semaphore);
        let runner = Arc::clone(&runner);
        let options = call_options.clone();
        let template = template.clone();
        let header = header.clone();
        let batch: Vec<Vec<String>> = batch.to_vec();
        async move {
            let _permit = semaphore.acquire().await.expect("arpeggio semaphore never closed");
            let prompt = render_batch_template(&template, &header, &batch, batch_index);
            runner.run(&prompt, options).await
        }
    });

    let results = join_all(futures).await;
    let mut combined = String::new();
    let mut had_error = None;
    for result in results {
        match result {
            Ok(response) => {
                combined.push_str(&response.content);
                combined.push('\n');
            }
            Err(e) => had_error = Some(e.to_string()),
        }
    }

    if let Some(err) = had_error {
        return Ok(DispatchResult {
            primary_response: Response::error(err, "1970-01-01T00:00:00Z"),
            phase3_response: None,
            sub_outcomes: Vec::new(),
            sub_history: Vec::new(),
        });
    }

    let phase3 = if movement.needs_phase3() {
        let prompt = engine.instructions.phase3(movement);
        Some(call_agent(engine, movement, &prompt, permission_mode).await?)
    } else {
        None
    };

    Ok(DispatchResult {
        primary_response: Response::done(combined, "1970-01-01T00:00:00Z"),
        phase3_response: phase3,
        sub_outcomes: Vec::new(),
        sub_history: Vec::new(),
    })
}

fn render_batch_template(template: &str, header: &[String], batch: &[Vec<String>], batch_index: usize) -> String {
    let mut out = template.replace("{batch_index}", &batch_index.to_string());
    for (n, row) in batch.iter().enumerate() {
        out = out.replace(&format!("{{line:{n}}}"), &row.join(","));
        for (col_idx, col_name) in header.iter().enumerate() {
            out = out.replace(&format!("{{col:{n}:{col_name}}}"), row.get(col_idx).map(String::as_str).unwrap_or(""));
        }
    }
    out
}

async fn call_agent(engine: &PieceEngine, movement: &Movement, prompt: &str, permission_mode: crate::domain::PermissionMode) -> Result<Response, EngineFailure> {
    let common = movement.common();
    let persona_text = match &common.persona_ref {
        Some(name) => engine.facets.resolve(FacetType::Persona, name).map(|(_, t)| t).unwrap_or_default(),
        None => String::new(),
    };

    let provider_options = resolve_provider_options(engine, movement);
    let persona = PersonaSpec {
        persona_text,
        provider_override: provider_options.provider.clone(),
        model_override: provider_options.model.clone(),
        output_schema: common.structured_output_schema.clone(),
    };
    let provider_name = provider_options.provider.clone().unwrap_or_else(|| "default".to_string());
    let runner = engine.provider.setup(persona).await.map_err(|e| EngineFailure { reason: e.to_string() })?;

    let session_id = common
        .persona_ref
        .as_ref()
        .and_then(|persona_name| engine.sessions.get(engine.cwd(), persona_name, &provider_name).ok().flatten());

    let options = CallOptions::new(engine.cwd().clone(), permission_mode)
        .with_abort(engine.abort_signal())
        .with_allowed_tools(common.allowed_tools.clone())
        .with_session_id(session_id)
        .with_output_schema(common.structured_output_schema.clone());

    let response = runner.run(prompt, options).await.map_err(|e| EngineFailure { reason: e.to_string() })?;

    if let (Some(persona_name), Some(session_id)) = (&common.persona_ref, &response.session_id) {
        if let Err(e) = engine.sessions.set(engine.cwd(), persona_name, &provider_name, session_id.clone()) {
            warn!(error = %e, "variants::call_agent: failed to persist session handle");
        }
    }

    Ok(response)
}

/// Merge a movement's own `provider`/`model` (higher precedence) over the
/// piece-wide defaults (§9 Open Question, resolved: movement > `Piece.provider_options`).
fn resolve_provider_options(engine: &PieceEngine, movement: &Movement) -> ProviderOptions {
    let common = movement.common();
    let movement_options = ProviderOptions {
        provider: common.provider.clone(),
        model: common.model.clone(),
        extra: std::collections::HashMap::new(),
    };
    movement_options.merged_over(&engine.piece.provider_options)
}

fn resolve_permission_mode(engine: &PieceEngine, movement: &Movement) -> crate::domain::PermissionMode {
    let floor = movement.common().required_permission_mode;
    let provider_options = resolve_provider_options(engine, movement);
    let provider_name = provider_options.provider.as_deref().unwrap_or("default");
    (engine.options.permission_mode_resolver)(provider_name, movement.name(), floor)
}

fn resolve_policy_knowledge(engine: &PieceEngine, movement: &Movement) -> String {
    let common = movement.common();
    let mut out = String::new();
    for policy in &common.policy_refs {
        if let Ok((_, text)) = engine.facets.resolve(FacetType::Policy, policy) {
            out.push_str(&text);
            out.push('\n');
        }
    }
    for knowledge in &common.knowledge_refs {
        if let Ok((_, text)) = engine.facets.resolve(FacetType::Knowledge, knowledge) {
            out.push_str(&text);
            out.push('\n');
        }
    }
    out
}

fn report_dir_for(engine: &PieceEngine, movement: &Movement) -> std::path::PathBuf {
    let spec: &ReportSpec = movement.common().report_spec.as_ref().expect("caller checked report_spec is present");
    engine.cwd().join(".takt").join("reports").join(&spec.report_dir_name)
}
