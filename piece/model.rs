//! The `Piece` data model: movements, rules, report specs
//!
//! These types are produced by [`super::loader`] and are immutable after
//! load — every `PieceEngine` run shares one `Piece` by reference.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::PermissionMode;

/// A named directed graph of movements that realizes one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub max_movements: u32,
    pub initial_movement: String,
    pub movements: Vec<Movement>,
    #[serde(default)]
    pub provider_options: ProviderOptions,
    #[serde(default)]
    pub runtime_prepare: Option<String>,
    /// Minimum runtime version required to execute this piece, `MAJOR.MINOR.PATCH`.
    #[serde(default)]
    pub min_version: Option<String>,
}

impl Piece {
    /// Look up a movement by name.
    pub fn movement(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|m| m.name() == name)
    }

    pub fn initial(&self) -> &Movement {
        self.movement(&self.initial_movement)
            .expect("loader guarantees initial_movement resolves")
    }
}

/// Piece-wide or piece_config-scoped provider defaults.
///
/// Merge precedence (Open Question, resolved in DESIGN.md): a movement's own
/// `provider`/`model` override these; these override `piece_config`-level
/// fallback, field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOptions {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProviderOptions {
    /// Merge `self` (higher precedence) over `fallback`, field by field.
    pub fn merged_over(&self, fallback: &ProviderOptions) -> ProviderOptions {
        let mut extra = fallback.extra.clone();
        extra.extend(self.extra.clone());
        ProviderOptions {
            provider: self.provider.clone().or_else(|| fallback.provider.clone()),
            model: self.model.clone().or_else(|| fallback.model.clone()),
            extra,
        }
    }
}

/// Common configuration shared by every movement kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementCommon {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub required_permission_mode: PermissionMode,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub edit: bool,
    #[serde(default)]
    pub pass_previous_response: bool,
    #[serde(default)]
    pub instruction_template: String,
    #[serde(default)]
    pub output_contracts: Vec<String>,
    #[serde(default)]
    pub persona_ref: Option<String>,
    #[serde(default)]
    pub policy_refs: Vec<String>,
    #[serde(default)]
    pub knowledge_refs: Vec<String>,
    #[serde(default)]
    pub report_spec: Option<ReportSpec>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Name of a structured-output schema to bind at normalization time, as
    /// written in the descriptor.
    #[serde(default)]
    pub structured_output_schema_ref: Option<String>,
    /// Populated by [`super::loader::PieceLoader`] from
    /// `structured_output_schema_ref`; absent until normalization runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output_schema: Option<serde_json::Value>,
}

/// One node in the piece graph.
///
/// A tagged-variant model (§9 design notes) rather than the source's
/// discriminated-by-optional-field record: each kind owns exactly the
/// configuration it needs, and the compiler enforces movements are never
/// more than one kind at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Movement {
    Single {
        #[serde(flatten)]
        common: MovementCommon,
    },
    Parallel {
        #[serde(flatten)]
        common: MovementCommon,
        sub_movements: Vec<Movement>,
    },
    TeamLeader {
        #[serde(flatten)]
        common: MovementCommon,
        lead_persona_ref: String,
        max_parts: u32,
        timeout_ms: u64,
    },
    Arpeggio {
        #[serde(flatten)]
        common: MovementCommon,
        csv_source: String,
        batch_size: u32,
        #[serde(default)]
        concurrency: u32,
    },
}

impl Movement {
    pub fn common(&self) -> &MovementCommon {
        match self {
            Movement::Single { common }
            | Movement::Parallel { common, .. }
            | Movement::TeamLeader { common, .. }
            | Movement::Arpeggio { common, .. } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut MovementCommon {
        match self {
            Movement::Single { common }
            | Movement::Parallel { common, .. }
            | Movement::TeamLeader { common, .. }
            | Movement::Arpeggio { common, .. } => common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn rules(&self) -> &[Rule] {
        &self.common().rules
    }

    pub fn has_report(&self) -> bool {
        self.common().report_spec.is_some()
    }

    /// Phase 3 runs when the movement has at least one rule and the rules
    /// are not all aggregate/AI (§4.3 Phase 3 prompt).
    pub fn needs_phase3(&self) -> bool {
        let rules = self.rules();
        !rules.is_empty() && rules.iter().any(|r| matches!(r.kind, RuleKind::Tag { .. }))
    }
}

/// A `(condition, next)` transition out of a movement.
///
/// Rules are ordered; for tag rules the 1-based ordinal *is* the tag index
/// (§9 design notes — load-bearing, exposed here rather than reconstructed
/// from list position at match time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub condition: String,
    pub next: NextMovement,
    pub kind: RuleKind,
    /// 1-based ordinal within the movement's rule list.
    #[serde(default)]
    pub ordinal: u32,
    /// Rule is skipped entirely when running non-interactively.
    #[serde(default)]
    pub interactive_only: bool,
    /// Extra template appended to the Phase 3 prompt when this rule matches,
    /// e.g. a structured checklist the judge should echo back.
    #[serde(default)]
    pub appendix_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Matches `[MOVEMENT_NAME:N]` tags, N == `Rule::ordinal`.
    Tag,
    /// Evaluated via an AI-judge call; `ai_condition_text` is `condition`.
    Ai,
    /// Parallel-movement aggregate rule.
    Aggregate { mode: AggregateMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMode {
    All,
    Any,
}

/// Where a matched rule sends execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextMovement {
    Terminal(Terminal),
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Terminal {
    Complete,
    Abort,
}

impl std::fmt::Display for NextMovement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextMovement::Terminal(Terminal::Complete) => write!(f, "COMPLETE"),
            NextMovement::Terminal(Terminal::Abort) => write!(f, "ABORT"),
            NextMovement::Named(name) => write!(f, "{name}"),
        }
    }
}

/// Declares how a movement's Phase 2 report is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSpec {
    pub report_dir_name: String,
    pub file_name: String,
    #[serde(default)]
    pub output_contract: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(name: &str) -> MovementCommon {
        MovementCommon {
            name: name.to_string(),
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
            rules: vec![],
            structured_output_schema_ref: None,
            structured_output_schema: None,
        }
    }

    #[test]
    fn piece_looks_up_movement_by_name() {
        let piece = Piece {
            name: "demo".into(),
            description: None,
            max_movements: 5,
            initial_movement: "start".into(),
            movements: vec![Movement::Single { common: common("start") }],
            provider_options: ProviderOptions::default(),
            runtime_prepare: None,
            min_version: None,
        };
        assert!(piece.movement("start").is_some());
        assert!(piece.movement("missing").is_none());
    }

    #[test]
    fn needs_phase3_false_with_no_rules() {
        let m = Movement::Single { common: common("a") };
        assert!(!m.needs_phase3());
    }

    #[test]
    fn needs_phase3_true_with_tag_rule() {
        let mut c = common("a");
        c.rules.push(Rule {
            condition: "Done".into(),
            next: NextMovement::Terminal(Terminal::Complete),
            kind: RuleKind::Tag,
            ordinal: 1,
            interactive_only: false,
        appendix_template: None,
        });
        let m = Movement::Single { common: c };
        assert!(m.needs_phase3());
    }

    #[test]
    fn needs_phase3_false_when_rules_all_aggregate() {
        let mut c = common("a");
        c.rules.push(Rule {
            condition: "approved".into(),
            next: NextMovement::Named("next".into()),
            kind: RuleKind::Aggregate { mode: AggregateMode::All },
            ordinal: 1,
            interactive_only: false,
        appendix_template: None,
        });
        let m = Movement::Single { common: c };
        assert!(!m.needs_phase3());
    }

    #[test]
    fn provider_options_merge_respects_precedence() {
        let high = ProviderOptions {
            provider: Some("anthropic".into()),
            model: None,
            extra: HashMap::new(),
        };
        let low = ProviderOptions {
            provider: Some("openai".into()),
            model: Some("gpt".into()),
            extra: HashMap::new(),
        };
        let merged = high.merged_over(&low);
        assert_eq!(merged.provider.as_deref(), Some("anthropic"));
        assert_eq!(merged.model.as_deref(), Some("gpt"));
    }

    #[test]
    fn next_movement_display() {
        assert_eq!(NextMovement::Terminal(Terminal::Complete).to_string(), "COMPLETE");
        assert_eq!(NextMovement::Named("fix".into()).to_string(), "fix");
    }
}
