//! Rule evaluator (§4.4)
//!
//! Given a movement and the responses produced for its phases, selects which
//! rule matched and what comes next. Five fallback stages run in order;
//! the first to produce a match wins.

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::piece::{AggregateMode, Movement, NextMovement, Rule, RuleKind};
use crate::provider::{AgentRunner, CallOptions, ProviderError};
use crate::response::Response;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("movement `{0}` has no rules to evaluate")]
    NoRules(String),

    #[error("no rule matched for movement `{0}` after exhausting every fallback stage")]
    NoMatch(String),

    #[error("ai-judge fallback failed: {0}")]
    AiJudge(#[from] ProviderError),

    #[error("ai-judge returned a non-integer or out-of-range answer twice: {0}")]
    AiJudgeMalformed(String),
}

/// Which of the five stages produced the match, for observability.
///
/// Tag-method variants (`TagPhase3`, `TagPhase1`) are coalesced to
/// `tag_fallback` when written to the externally-visible session log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    AutoSelect,
    Aggregate,
    TagPhase3,
    StructuredOutput,
    TagPhase1,
    AiJudge,
}

impl MatchMethod {
    /// The externally-visible session-log label (§4.4).
    pub fn log_label(self) -> &'static str {
        match self {
            MatchMethod::AutoSelect => "auto_select",
            MatchMethod::Aggregate => "aggregate",
            MatchMethod::TagPhase3 | MatchMethod::TagPhase1 => "tag_fallback",
            MatchMethod::StructuredOutput => "structured_output",
            MatchMethod::AiJudge => "ai_judge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_index: usize,
    pub method: MatchMethod,
}

/// One sub-movement's outcome, as seen by the aggregate stage: the rule
/// condition text it matched, if any.
#[derive(Debug, Clone)]
pub struct SubMovementOutcome {
    pub matched_condition: Option<String>,
}

pub struct RuleEvaluator {
    tag_pattern_cache: std::sync::Mutex<Option<Regex>>,
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self {
            tag_pattern_cache: std::sync::Mutex::new(None),
        }
    }

    /// Evaluate a non-parallel movement.
    ///
    /// `interactive` gates `Rule::interactive_only` rules (§3): when `false`
    /// those rules are invisible to every stage, including the ai-judge menu.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        movement: &Movement,
        phase1: &Response,
        phase3: Option<&Response>,
        judge: Option<&Arc<dyn AgentRunner>>,
        judge_call_options: Option<CallOptions>,
        interactive: bool,
    ) -> Result<RuleMatch, RuleError> {
        let rules = movement.rules();
        if rules.is_empty() {
            return Err(RuleError::NoRules(movement.name().to_string()));
        }

        debug!(movement = movement.name(), rule_count = rules.len(), "RuleEvaluator::evaluate: called");

        if let Some(m) = self.stage0_auto_select(rules, interactive) {
            return Ok(m);
        }
        if let Some(response) = phase3 {
            if let Some(m) = self.stage2_tag_match(rules, &response.content, MatchMethod::TagPhase3, interactive) {
                return Ok(m);
            }
            if let Some(m) = self.stage3_structured_output(rules, response, interactive) {
                return Ok(m);
            }
        }
        if let Some(m) = self.stage4_tag_match(rules, &phase1.content, interactive) {
            return Ok(m);
        }

        match (judge, judge_call_options) {
            (Some(judge), Some(options)) => self.stage5_ai_judge(movement, rules, phase1, phase3, judge, options, interactive).await,
            _ => Err(RuleError::NoMatch(movement.name().to_string())),
        }
    }

    /// Evaluate a parallel movement's aggregate rules against its
    /// sub-movements' own matched outcomes (§4.4 stage 1).
    pub fn evaluate_aggregate(&self, movement: &Movement, sub_outcomes: &[SubMovementOutcome], interactive: bool) -> Option<RuleMatch> {
        let rules = movement.rules();
        for (index, rule) in rules.iter().enumerate() {
            if rule.interactive_only && !interactive {
                continue;
            }
            let RuleKind::Aggregate { mode } = rule.kind else { continue };
            let matched = match mode {
                AggregateMode::All => sub_outcomes
                    .iter()
                    .all(|o| o.matched_condition.as_deref() == Some(rule.condition.as_str())),
                AggregateMode::Any => sub_outcomes
                    .iter()
                    .any(|o| o.matched_condition.as_deref() == Some(rule.condition.as_str())),
            };
            if matched {
                debug!(movement = movement.name(), rule_index = index, "RuleEvaluator::evaluate_aggregate: matched");
                return Some(RuleMatch {
                    rule_index: index,
                    method: MatchMethod::Aggregate,
                });
            }
        }
        None
    }

    fn stage0_auto_select(&self, rules: &[Rule], interactive: bool) -> Option<RuleMatch> {
        let non_aggregate: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| !matches!(r.kind, RuleKind::Aggregate { .. }) && (interactive || !r.interactive_only))
            .map(|(i, _)| i)
            .collect();
        if non_aggregate.len() == 1 {
            return Some(RuleMatch {
                rule_index: non_aggregate[0],
                method: MatchMethod::AutoSelect,
            });
        }
        None
    }

    fn stage2_tag_match(&self, rules: &[Rule], text: &str, method: MatchMethod, interactive: bool) -> Option<RuleMatch> {
        let ordinal = self.last_matching_tag_ordinal(text)?;
        rules
            .iter()
            .position(|r| matches!(r.kind, RuleKind::Tag) && r.ordinal == ordinal && (interactive || !r.interactive_only))
            .map(|rule_index| RuleMatch { rule_index, method })
    }

    fn stage4_tag_match(&self, rules: &[Rule], text: &str, interactive: bool) -> Option<RuleMatch> {
        self.stage2_tag_match(rules, text, MatchMethod::TagPhase1, interactive)
    }

    fn stage3_structured_output(&self, rules: &[Rule], response: &Response, interactive: bool) -> Option<RuleMatch> {
        let step = response.structured_step()?;
        rules
            .iter()
            .position(|r| matches!(r.kind, RuleKind::Tag) && r.ordinal == step && (interactive || !r.interactive_only))
            .map(|rule_index| RuleMatch {
                rule_index,
                method: MatchMethod::StructuredOutput,
            })
    }

    async fn stage5_ai_judge(
        &self,
        movement: &Movement,
        rules: &[Rule],
        phase1: &Response,
        phase3: Option<&Response>,
        judge: &Arc<dyn AgentRunner>,
        options: CallOptions,
        interactive: bool,
    ) -> Result<RuleMatch, RuleError> {
        let eligible: Vec<(usize, &Rule)> = rules.iter().enumerate().filter(|(_, r)| interactive || !r.interactive_only).collect();
        if eligible.is_empty() {
            return Err(RuleError::NoMatch(movement.name().to_string()));
        }
        let prompt = judge_prompt(movement, &eligible, phase1, phase3);
        for attempt in 0..2 {
            let response = judge.run(&prompt, options.clone()).await?;
            match parse_judge_answer(&response.content, eligible.len()) {
                Some(n) => {
                    return Ok(RuleMatch {
                        rule_index: eligible[n - 1].0,
                        method: MatchMethod::AiJudge,
                    });
                }
                None => {
                    warn!(movement = movement.name(), attempt, "RuleEvaluator::stage5_ai_judge: malformed answer, retrying");
                }
            }
        }
        Err(RuleError::AiJudgeMalformed(movement.name().to_string()))
    }

    /// Scan for `[MOVEMENT_NAME:N]` tags anywhere in `text`; the **last**
    /// occurrence wins (tolerates verbose preambles).
    fn last_matching_tag_ordinal(&self, text: &str) -> Option<u32> {
        let mut cache = self.tag_pattern_cache.lock().expect("tag pattern cache lock poisoned");
        let pattern = cache.get_or_insert_with(|| Regex::new(r"\[[A-Za-z0-9_\-]+:(\d+)\]").expect("tag regex is static and valid"));
        pattern
            .captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
    }
}

fn judge_prompt(movement: &Movement, rules: &[(usize, &Rule)], phase1: &Response, phase3: Option<&Response>) -> String {
    let mut out = format!(
        "You are judging which transition applies for movement `{}`. Respond with exactly one integer in [1, {}].\n\n",
        movement.name(),
        rules.len()
    );
    for (i, (_, rule)) in rules.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, rule.condition));
    }
    out.push_str("\nPrimary response:\n");
    out.push_str(&phase1.content);
    if let Some(p3) = phase3 {
        out.push_str("\n\nStatus response:\n");
        out.push_str(&p3.content);
    }
    out
}

/// Parse a lone integer answer in `[1, rule_count]`.
fn parse_judge_answer(text: &str, rule_count: usize) -> Option<usize> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() != text.trim().chars().filter(|c| !c.is_whitespace()).count() {
        return None;
    }
    let n: usize = digits.parse().ok()?;
    if n >= 1 && n <= rule_count {
        Some(n)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PermissionMode;
    use crate::piece::{MovementCommon, Terminal};
    use crate::provider::{MockAgentRunner, MockTurn};
    use crate::response::ResponseStatus;

    fn common_with_rules(rules: Vec<Rule>) -> MovementCommon {
        MovementCommon {
            name: "review".into(),
            description: None,
            allowed_tools: vec![],
            required_permission_mode: PermissionMode::Readonly,
            provider: None,
            model: None,
            edit: false,
            pass_previous_response: false,
            instruction_template: String::new(),
            output_contracts: vec![],
            persona_ref: None,
            policy_refs: vec![],
            knowledge_refs: vec![],
            report_spec: None,
            rules,
            structured_output_schema_ref: None,
            structured_output_schema: None,
        }
    }

    fn tag_rule(ordinal: u32, condition: &str, next: NextMovement) -> Rule {
        Rule {
            condition: condition.into(),
            next,
            kind: RuleKind::Tag,
            ordinal,
            interactive_only: false,
            appendix_template: None,
        }
    }

    fn resp(content: &str) -> Response {
        Response::done(content, "t")
    }

    #[tokio::test]
    async fn stage0_auto_selects_sole_non_aggregate_rule() {
        let movement = Movement::Single {
            common: common_with_rules(vec![tag_rule(1, "done", NextMovement::Terminal(Terminal::Complete))]),
        };
        let evaluator = RuleEvaluator::new();
        let m = evaluator.evaluate(&movement, &resp("anything"), None, None, None, false).await.unwrap();
        assert_eq!(m.rule_index, 0);
        assert_eq!(m.method, MatchMethod::AutoSelect);
    }

    #[tokio::test]
    async fn stage2_tag_match_prefers_last_occurrence() {
        let movement = Movement::Single {
            common: common_with_rules(vec![
                tag_rule(1, "needs fix", NextMovement::Named("fix".into())),
                tag_rule(2, "approved", NextMovement::Terminal(Terminal::Complete)),
            ]),
        };
        let evaluator = RuleEvaluator::new();
        let phase3 = resp("preamble blah [review:1] more talk [review:2]");
        let m = evaluator.evaluate(&movement, &resp("p1"), Some(&phase3), None, None, false).await.unwrap();
        assert_eq!(m.rule_index, 1);
        assert_eq!(m.method, MatchMethod::TagPhase3);
    }

    #[tokio::test]
    async fn stage3_structured_output_reads_step() {
        let movement = Movement::Single {
            common: common_with_rules(vec![
                tag_rule(1, "needs fix", NextMovement::Named("fix".into())),
                tag_rule(2, "approved", NextMovement::Terminal(Terminal::Complete)),
            ]),
        };
        let evaluator = RuleEvaluator::new();
        let phase3 = resp("ok").with_structured_output(serde_json::json!({"step": 2}));
        let m = evaluator.evaluate(&movement, &resp("p1"), Some(&phase3), None, None, false).await.unwrap();
        assert_eq!(m.rule_index, 1);
        assert_eq!(m.method, MatchMethod::StructuredOutput);
    }

    #[tokio::test]
    async fn stage4_falls_back_to_phase1_tag_when_no_phase3() {
        let movement = Movement::Single {
            common: common_with_rules(vec![
                tag_rule(1, "needs fix", NextMovement::Named("fix".into())),
                tag_rule(2, "approved", NextMovement::Terminal(Terminal::Complete)),
            ]),
        };
        let evaluator = RuleEvaluator::new();
        let phase1 = resp("I think this is [review:1] for now");
        let m = evaluator.evaluate(&movement, &phase1, None, None, None, false).await.unwrap();
        assert_eq!(m.rule_index, 0);
        assert_eq!(m.method, MatchMethod::TagPhase1);
    }

    #[tokio::test]
    async fn stage5_ai_judge_used_as_last_resort() {
        let movement = Movement::Single {
            common: common_with_rules(vec![
                tag_rule(1, "needs fix", NextMovement::Named("fix".into())),
                tag_rule(2, "approved", NextMovement::Terminal(Terminal::Complete)),
            ]),
        };
        let evaluator = RuleEvaluator::new();
        let judge: Arc<dyn AgentRunner> = Arc::new(MockAgentRunner::new(vec![MockTurn {
            content: "2".into(),
            status: ResponseStatus::Answer,
            structured_output: None,
        }]));
        let options = CallOptions::new(std::path::PathBuf::from("/tmp"), PermissionMode::Readonly);
        let m = evaluator
            .evaluate(&movement, &resp("no tags here"), None, Some(&judge), Some(options), false)
            .await
            .unwrap();
        assert_eq!(m.rule_index, 1);
        assert_eq!(m.method, MatchMethod::AiJudge);
    }

    #[tokio::test]
    async fn ai_judge_retries_once_on_malformed_answer() {
        let movement = Movement::Single {
            common: common_with_rules(vec![
                tag_rule(1, "needs fix", NextMovement::Named("fix".into())),
                tag_rule(2, "approved", NextMovement::Terminal(Terminal::Complete)),
            ]),
        };
        let evaluator = RuleEvaluator::new();
        let judge: Arc<dyn AgentRunner> = Arc::new(MockAgentRunner::new(vec![
            MockTurn {
                content: "not a number".into(),
                status: ResponseStatus::Answer,
                structured_output: None,
            },
            MockTurn {
                content: "1".into(),
                status: ResponseStatus::Answer,
                structured_output: None,
            },
        ]));
        let options = CallOptions::new(std::path::PathBuf::from("/tmp"), PermissionMode::Readonly);
        let m = evaluator
            .evaluate(&movement, &resp("no tags"), None, Some(&judge), Some(options), false)
            .await
            .unwrap();
        assert_eq!(m.rule_index, 0);
    }

    #[test]
    fn aggregate_all_requires_every_sub_movement_to_match() {
        let movement = Movement::Parallel {
            common: common_with_rules(vec![Rule {
                condition: "approved".into(),
                next: NextMovement::Terminal(Terminal::Complete),
                kind: RuleKind::Aggregate { mode: AggregateMode::All },
                ordinal: 1,
                interactive_only: false,
                appendix_template: None,
            }]),
            sub_movements: vec![],
        };
        let evaluator = RuleEvaluator::new();
        let all_approved = [
            SubMovementOutcome { matched_condition: Some("approved".into()) },
            SubMovementOutcome { matched_condition: Some("approved".into()) },
        ];
        assert!(evaluator.evaluate_aggregate(&movement, &all_approved, false).is_some());

        let mixed = [
            SubMovementOutcome { matched_condition: Some("approved".into()) },
            SubMovementOutcome { matched_condition: Some("rejected".into()) },
        ];
        assert!(evaluator.evaluate_aggregate(&movement, &mixed, false).is_none());
    }

    #[test]
    fn aggregate_any_matches_on_first_carrier() {
        let movement = Movement::Parallel {
            common: common_with_rules(vec![Rule {
                condition: "flagged".into(),
                next: NextMovement::Terminal(Terminal::Abort),
                kind: RuleKind::Aggregate { mode: AggregateMode::Any },
                ordinal: 1,
                interactive_only: false,
                appendix_template: None,
            }]),
            sub_movements: vec![],
        };
        let evaluator = RuleEvaluator::new();
        let outcomes = [
            SubMovementOutcome { matched_condition: Some("ok".into()) },
            SubMovementOutcome { matched_condition: Some("flagged".into()) },
        ];
        assert!(evaluator.evaluate_aggregate(&movement, &outcomes, false).is_some());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Whatever text surrounds a single `[name:N]` tag, extraction always
        /// recovers `N` (§4 tag-match stage tolerates verbose preambles).
        #[test]
        fn last_matching_tag_ordinal_recovers_the_embedded_ordinal(
            ordinal in 1u32..10_000,
            prefix in "[a-zA-Z ]{0,40}",
            suffix in "[a-zA-Z ]{0,40}",
        ) {
            let evaluator = RuleEvaluator::new();
            let text = format!("{prefix}[movement_x:{ordinal}]{suffix}");
            prop_assert_eq!(evaluator.last_matching_tag_ordinal(&text), Some(ordinal));
        }
    }
}
