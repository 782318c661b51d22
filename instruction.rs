//! Instruction builder (§4.3)
//!
//! Assembles the three per-phase prompts from a movement's facets and the
//! engine's current iteration state. Pure: every input is already
//! materialized text by the time it reaches here, so building never does I/O.

use std::path::Path;

use handlebars::Handlebars;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::piece::{Movement, ReportSpec, Rule, RuleKind};

#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("instruction_template failed to render: {0}")]
    TemplateRender(#[from] handlebars::RenderError),
}

/// Everything the builder needs about where a piece run currently stands.
#[derive(Debug, Clone)]
pub struct IterationContext<'a> {
    pub working_dir: &'a Path,
    pub task_text: &'a str,
    pub user_inputs: &'a [String],
    pub previous_response: Option<&'a str>,
    pub movement_index: usize,
    pub movement_count: usize,
    pub iteration: u32,
    pub max_movements: u32,
    pub movement_iteration: u32,
    pub report_dir: Option<&'a Path>,
    pub policy_knowledge_text: &'a str,
    pub language: &'a str,
}

#[derive(Default)]
pub struct InstructionBuilder {
    handlebars: Handlebars<'static>,
}

impl InstructionBuilder {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        Self { handlebars }
    }

    /// Build the Phase 1 (main work) prompt.
    pub fn phase1(&self, movement: &Movement, ctx: &IterationContext) -> Result<String, InstructionError> {
        debug!(movement = movement.name(), "InstructionBuilder::phase1: called");
        let common = movement.common();
        let mut out = String::new();

        out.push_str(&self.execution_context_block(ctx, common.edit, false));

        out.push_str(&format!(
            "Piece has {} movement(s); current: {} ({}/{}) ← current\n",
            ctx.movement_count,
            movement.name(),
            ctx.movement_index + 1,
            ctx.movement_count
        ));
        if let Some(desc) = &common.description {
            out.push_str(&format!("Description: {desc}\n"));
        }
        out.push('\n');

        out.push_str(&format!(
            "Iteration {}/{}, movement iteration {}, movement `{}`.\n\n",
            ctx.iteration, ctx.max_movements, ctx.movement_iteration, movement.name()
        ));

        if let (Some(report_dir), Some(report_spec)) = (ctx.report_dir, &common.report_spec) {
            out.push_str(&format!(
                "Report directory: {}\nReport file: {}\n(Phase 2 will generate this file's contents.)\n\n",
                report_dir.display(),
                report_dir.join(&report_spec.file_name).display()
            ));
        }

        let template_references_task = common.instruction_template.contains("{task}");
        if !template_references_task {
            out.push_str("User request:\n");
            out.push_str(ctx.task_text);
            out.push_str("\n\n");
        }

        let template_references_user_inputs = common.instruction_template.contains("{user_inputs}");
        if !template_references_user_inputs && !ctx.user_inputs.is_empty() {
            out.push_str("Additional user inputs:\n");
            for input in ctx.user_inputs {
                out.push_str("- ");
                out.push_str(input);
                out.push('\n');
            }
            out.push('\n');
        }

        if common.pass_previous_response {
            if let Some(prev) = ctx.previous_response {
                out.push_str("Previous response:\n");
                out.push_str(prev);
                out.push_str("\n\n");
            }
        }

        out.push_str(&self.substitute_placeholders(&common.instruction_template, ctx));
        out.push('\n');

        if !ctx.policy_knowledge_text.is_empty() {
            out.push('\n');
            out.push_str(ctx.policy_knowledge_text);
        }

        Ok(out)
    }

    /// Build the Phase 2 (report) prompt. Callers must first check
    /// `movement.has_report()`.
    pub fn phase2(&self, movement: &Movement, ctx: &IterationContext) -> Result<String, InstructionError> {
        debug!(movement = movement.name(), "InstructionBuilder::phase2: called");
        let common = movement.common();
        let report_spec = common
            .report_spec
            .as_ref()
            .expect("caller must check movement.has_report() before calling phase2");

        let mut out = String::new();
        out.push_str(&self.execution_context_block(ctx, false, true));

        let report_dir = ctx.report_dir.expect("report_spec implies a report_dir is configured");
        out.push_str(&format!(
            "Report directory: {}\nReport file: {}\n\n",
            report_dir.display(),
            report_dir.join(&report_spec.file_name).display()
        ));

        match &report_spec.output_contract {
            Some(contract) => {
                out.push_str("Write the report following this contract:\n");
                out.push_str(contract);
                out.push('\n');
            }
            None => {
                out.push_str(&format!(
                    "Append your report under a `## Iteration {}` section in the report file.\n",
                    ctx.iteration
                ));
            }
        }

        Ok(out)
    }

    /// Build the Phase 3 (status judgment) prompt. Callers must first check
    /// `movement.needs_phase3()`.
    pub fn phase3(&self, movement: &Movement) -> String {
        debug!(movement = movement.name(), "InstructionBuilder::phase3: called");
        let mut out = String::from("Determine status without performing additional work.\n\n");
        out.push_str("| idx | condition | next |\n|---|---|---|\n");

        for rule in movement.rules().iter().filter(|r| matches!(r.kind, RuleKind::Tag)) {
            out.push_str(&format!("| {} | {} | [{}:{}] |\n", rule.ordinal, rule.condition, movement.name(), rule.ordinal));
        }
        out.push('\n');

        out.push_str("Respond with exactly one of:\n");
        for rule in movement.rules().iter().filter(|r| matches!(r.kind, RuleKind::Tag)) {
            out.push_str(&format!("- [{}:{}] — {}\n", movement.name(), rule.ordinal, rule.condition));
        }

        if let Some(appendix) = appendix_template(movement.rules()) {
            out.push_str("\nAppendix:\n");
            out.push_str(&appendix);
        }

        out
    }

    fn execution_context_block(&self, ctx: &IterationContext, edit: bool, is_phase2: bool) -> String {
        let mut out = String::new();
        out.push_str(&format!("Working directory: {}\n", ctx.working_dir.display()));
        if edit {
            out.push_str("Editing is enabled for this movement.\n");
        } else {
            out.push_str("Editing is disabled for this movement; do not modify files.\n");
        }
        out.push_str("Do not commit. Do not change directory.\n");
        if is_phase2 {
            out.push_str("Do not modify source files.\n");
        }
        if ctx.language != "en" {
            out.push_str(&format!("Respond in {}.\n", ctx.language));
        }
        out.push('\n');
        out
    }

    fn substitute_placeholders(&self, template: &str, ctx: &IterationContext) -> String {
        let mut rendered = template
            .replace("{task}", ctx.task_text)
            .replace("{iteration}", &ctx.iteration.to_string())
            .replace("{max_iterations}", &ctx.max_movements.to_string())
            .replace("{movement_iteration}", &ctx.movement_iteration.to_string())
            .replace("{previous_response}", ctx.previous_response.unwrap_or(""))
            .replace("{user_inputs}", &ctx.user_inputs.join("\n"));

        if let Some(report_dir) = ctx.report_dir {
            rendered = rendered.replace("{report_dir}", &report_dir.display().to_string());
            rendered = replace_report_file_placeholder(&rendered, report_dir);
        }

        let data = json!({
            "task": ctx.task_text,
            "iteration": ctx.iteration,
            "max_iterations": ctx.max_movements,
            "movement_iteration": ctx.movement_iteration,
        });
        self.handlebars.render_template(&rendered, &data).unwrap_or(rendered)
    }
}

/// Replace every `{report:FILENAME}` occurrence with `report_dir/FILENAME`.
fn replace_report_file_placeholder(text: &str, report_dir: &Path) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{report:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "{report:".len()..];
        match after.find('}') {
            Some(end) => {
                let filename = &after[..end];
                out.push_str(&report_dir.join(filename).display().to_string());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn appendix_template(rules: &[Rule]) -> Option<String> {
    rules.iter().find_map(|r| r.appendix_template.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PermissionMode;
    use crate::piece::{MovementCommon, NextMovement, Terminal};

    fn common(edit: bool, template: &str, report_spec: Option<ReportSpec>) -> MovementCommon {
        MovementCommon {
            name: "work".into(),
            description: Some("does the work".into()),
            allowed_tools: vec![],
            required_permission_mode: PermissionMode::Edit,
            provider: None,
            model: None,
            edit,
            pass_previous_response: false,
            instruction_template: template.into(),
            output_contracts: vec![],
            persona_ref: None,
            policy_refs: vec![],
            knowledge_refs: vec![],
            report_spec,
            rules: vec![],
            structured_output_schema_ref: None,
            structured_output_schema: None,
        }
    }

    fn ctx<'a>(working_dir: &'a Path, task_text: &'a str, report_dir: Option<&'a Path>) -> IterationContext<'a> {
        IterationContext {
            working_dir,
            task_text,
            user_inputs: &[],
            previous_response: None,
            movement_index: 0,
            movement_count: 1,
            iteration: 1,
            max_movements: 5,
            movement_iteration: 1,
            report_dir,
            policy_knowledge_text: "",
            language: "en",
        }
    }

    #[test]
    fn phase1_omits_user_request_when_template_references_task() {
        let builder = InstructionBuilder::new();
        let movement = Movement::Single { common: common(true, "Do this: {task}", None) };
        let dir = Path::new("/tmp/work");
        let context = ctx(dir, "fix the bug", None);
        let prompt = builder.phase1(&movement, &context).unwrap();
        assert!(!prompt.contains("User request:"));
        assert!(prompt.contains("Do this: fix the bug"));
    }

    #[test]
    fn phase1_includes_user_request_when_template_silent_on_task() {
        let builder = InstructionBuilder::new();
        let movement = Movement::Single { common: common(true, "Proceed.", None) };
        let dir = Path::new("/tmp/work");
        let context = ctx(dir, "fix the bug", None);
        let prompt = builder.phase1(&movement, &context).unwrap();
        assert!(prompt.contains("User request:"));
        assert!(prompt.contains("fix the bug"));
    }

    #[test]
    fn phase1_report_dir_placeholder_substitution() {
        let builder = InstructionBuilder::new();
        let movement = Movement::Single { common: common(true, "Write notes to {report:notes.md}", None) };
        let dir = Path::new("/tmp/work");
        let report_dir = Path::new("/tmp/work/.takt/reports/run1");
        let context = ctx(dir, "task", Some(report_dir));
        let prompt = builder.phase1(&movement, &context).unwrap();
        assert!(prompt.contains("/tmp/work/.takt/reports/run1/notes.md"));
    }

    #[test]
    fn phase1_edit_disabled_line_present_only_when_not_editing() {
        let builder = InstructionBuilder::new();
        let movement = Movement::Single { common: common(false, "go", None) };
        let dir = Path::new("/tmp/work");
        let context = ctx(dir, "task", None);
        let prompt = builder.phase1(&movement, &context).unwrap();
        assert!(prompt.contains("Editing is disabled"));
    }

    #[test]
    fn phase2_requires_report_spec() {
        let builder = InstructionBuilder::new();
        let spec = ReportSpec {
            report_dir_name: "reports".into(),
            file_name: "notes.md".into(),
            output_contract: None,
        };
        let movement = Movement::Single { common: common(false, "", Some(spec)) };
        let dir = Path::new("/tmp/work");
        let report_dir = Path::new("/tmp/work/.takt/reports/run1");
        let context = ctx(dir, "task", Some(report_dir));
        let prompt = builder.phase2(&movement, &context).unwrap();
        assert!(prompt.contains("Append your report under a `## Iteration 1` section"));
        assert!(!prompt.contains("User request"));
    }

    #[test]
    fn phase3_lists_every_tag_rule_with_ordinal() {
        let mut c = common(false, "", None);
        c.rules.push(Rule {
            condition: "all tests pass".into(),
            next: NextMovement::Terminal(Terminal::Complete),
            kind: RuleKind::Tag,
            ordinal: 1,
            interactive_only: false,
        appendix_template: None,
        });
        c.rules.push(Rule {
            condition: "needs another pass".into(),
            next: NextMovement::Named("work".into()),
            kind: RuleKind::Tag,
            ordinal: 2,
            interactive_only: false,
        appendix_template: None,
        });
        let movement = Movement::Single { common: c };
        let builder = InstructionBuilder::new();
        let prompt = builder.phase3(&movement);
        assert!(prompt.contains("[work:1]"));
        assert!(prompt.contains("[work:2]"));
        assert!(prompt.contains("Determine status without performing additional work."));
    }
}
