//! Prompt templates for the planning phases.
//!
//! Templates are compiled into the binary; `{placeholder}` markers are
//! substituted at call sites. The content is passed to the model unchanged.

/// Pre-planning: task understanding.
pub const UNDERSTANDING: &str = r#"Analyze the following task and return your understanding as JSON.

=== Task ===
{task}

Return ONLY a JSON object of this shape:
{
  "task_type": "bug_fix | feature | refactoring | documentation | investigation | other",
  "primary_goal": "one-sentence goal",
  "expected_deliverables": ["..."],
  "constraints": ["..."],
  "scope": "in-scope and out-of-scope summary",
  "understanding_confidence": 0.0,
  "ambiguities": ["open questions about the request"]
}"#;

/// Pre-planning: information collection planning.
pub const COLLECTION_PLANNING: &str = r#"Based on this task understanding, list the information needed before planning.

=== Understanding ===
{understanding}

=== Available tools ===
{tools}

Return ONLY a JSON object of this shape:
{
  "skip_collection": false,
  "collection_order": ["info_1", "info_2"],
  "required_information": [
    {
      "id": "info_1",
      "category": "repository | issue | environment | dependency | other",
      "description": "what is needed and why",
      "collection_method": {"tool": "<server>_<tool>", "parameters": {}},
      "fallback_strategy": "what to do when collection fails",
      "can_assume": true,
      "default_assumption": "value to assume when collection fails"
    }
  ]
}"#;

/// Pre-planning: assumption generation for a failed collection item.
pub const ASSUMPTION: &str = r#"Collecting the following information failed. Propose a reasonable assumption to proceed with.

=== Item ===
{item}

=== Failure ===
{failure}

Return ONLY a JSON object: {"assumption": "...", "confidence": 0.0, "rationale": "..."}"#;

/// Planning: goal understanding, decomposition and action plan.
pub const PLANNING: &str = r#"Create a comprehensive plan for the following task.

=== Task ===
{task}

=== Collected context ===
{context}

=== Available tools ===
{tools}

Return ONLY a JSON object of this shape:
{
  "goal_understanding": {
    "goal": "...",
    "success_criteria": ["verifiable criteria"]
  },
  "task_decomposition": {
    "subtasks": [
      {"task_id": "task_1", "description": "...", "dependencies": [], "estimated_complexity": "low | medium | high"}
    ],
    "reasoning": "why this decomposition"
  },
  "action_plan": {
    "execution_order": ["task_1"],
    "actions": [
      {"task_id": "task_1", "purpose": "...", "tool": "<server>_<tool>", "parameters": {}, "expected_outcome": "...", "fallback": "..."}
    ]
  }
}"#;

/// Execution: one action.
pub const ACTION: &str = r#"Execute the following action from the plan. Use the available tools when needed.
When the action is complete, reply with a JSON object {"done": true, "comment": "what was accomplished"}.
If you cannot execute it, reply {"done": false, "comment": "why"}.

=== Action ===
{action}"#;

/// Reflection on recent results.
pub const REFLECTION: &str = r#"Reflect on the recent execution results and decide whether the plan still holds.

=== Results ===
{results}

=== Current plan ===
{plan}

Return ONLY a JSON object of this shape:
{
  "evaluation": "what happened and how well it matches the plan",
  "success": true,
  "failure_reason": "present when success is false",
  "key_failures": ["tools or steps that keep failing"],
  "plan_revision_needed": false
}"#;

/// Plan revision after a reflection requested one.
pub const REVISION: &str = r#"Revise the plan based on this reflection. Keep completed work; change only what the reflection shows is wrong.

=== Reflection ===
{reflection}

=== Current plan ===
{plan}

Return ONLY a JSON object with the same shape as the original plan
(goal_understanding, task_decomposition, action_plan)."#;

/// Verification against the success criteria.
pub const VERIFICATION: &str = r#"Verify the completed work against the success criteria.

=== Success criteria ===
{criteria}

=== Executed actions ===
{actions}

=== Workspace state ===
{workspace}

Return ONLY a JSON object of this shape:
{
  "verification_passed": true,
  "completion_confidence": 0.0,
  "comment": "summary for the issue",
  "issues_found": ["..."],
  "placeholder_detected": {"count": 0, "locations": ["file:line"]},
  "additional_work_needed": false,
  "additional_actions": [
    {"task_id": "extra_1", "purpose": "...", "tool": "<server>_<tool>", "parameters": {}, "expected_outcome": "...", "fallback": "..."}
  ]
}"#;

/// Shared JSON contract appended to every replan prompt.
const REPLAN_CONTRACT: &str = r#"Return ONLY a JSON object of this shape:
{
  "replan_decision": {
    "replan_needed": false,
    "confidence": 0.0,
    "reasoning": "...",
    "replan_type": "clarification_request | goal_revision | task_redecomposition | action_regeneration | partial_replan | full_replan | plan_revision | retry | none",
    "target_phase": "goal_understanding | task_decomposition | action_sequence | execution | reflection",
    "replan_level": 0,
    "issues_found": [],
    "recommended_actions": [],
    "clarification_needed": false,
    "clarification_questions": [],
    "error_classification": "transient | persistent | fatal",
    "recovery_strategy": "",
    "affected_actions": [],
    "evaluation_result": "success | partial_success | failure",
    "achievement_rate": 0,
    "additional_actions": [],
    "assumptions_to_make": []
  }
}"#;

/// Replan prompt templates, one per phase.
pub struct ReplanPromptBuilder {
    available_tools: Vec<String>,
}

impl ReplanPromptBuilder {
    pub fn new(available_tools: Vec<String>) -> Self {
        Self { available_tools }
    }

    pub fn goal_understanding(&self, result: &serde_json::Value, task_request: &str) -> String {
        format!(
            "Review this goal understanding for correctness and completeness.\n\n\
             === Task request ===\n{task_request}\n\n\
             === Goal understanding ===\n{result}\n\n\
             Does it need to be redone? Consider missed requirements and misread intent.\n\n{REPLAN_CONTRACT}"
        )
    }

    pub fn task_decomposition(&self, result: &serde_json::Value, goal: &serde_json::Value) -> String {
        format!(
            "Review this task decomposition against the goal.\n\n\
             === Goal ===\n{goal}\n\n\
             === Decomposition ===\n{result}\n\n\
             Check for missing subtasks, wrong dependencies and infeasible complexity.\n\n{REPLAN_CONTRACT}"
        )
    }

    pub fn action_sequence(&self, action_plan: &serde_json::Value, subtasks: &serde_json::Value) -> String {
        format!(
            "Review this action plan for feasibility with the available tools.\n\n\
             === Subtasks ===\n{subtasks}\n\n\
             === Action plan ===\n{action_plan}\n\n\
             === Available tools ===\n{}\n\n\
             Flag actions using unavailable tools or with unreachable expected outcomes.\n\n{REPLAN_CONTRACT}",
            self.available_tools.join(", ")
        )
    }

    pub fn execution(&self, action: &serde_json::Value, result: &serde_json::Value, consecutive_errors: u32) -> String {
        format!(
            "An action was executed. Decide whether to proceed, retry, or replan.\n\n\
             === Action ===\n{action}\n\n\
             === Result ===\n{result}\n\n\
             Consecutive errors on this tool: {consecutive_errors}\n\n\
             Classify any error as transient, persistent or fatal and pick the cheapest recovery.\n\n{REPLAN_CONTRACT}"
        )
    }

    pub fn reflection(&self, goal: &serde_json::Value, summary: &serde_json::Value) -> String {
        format!(
            "Evaluate overall progress against the goal and decide whether a plan-level change is needed.\n\n\
             === Goal ===\n{goal}\n\n\
             === Execution summary ===\n{summary}\n\n{REPLAN_CONTRACT}"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_replan_template_carries_contract() {
        let builder = ReplanPromptBuilder::new(vec!["github_get_issue".to_string()]);
        let value = json!({"k": "v"});

        for prompt in [
            builder.goal_understanding(&value, "req"),
            builder.task_decomposition(&value, &value),
            builder.action_sequence(&value, &value),
            builder.execution(&value, &value, 2),
            builder.reflection(&value, &value),
        ] {
            assert!(prompt.contains("replan_decision"));
            assert!(prompt.contains("replan_needed"));
        }
    }

    #[test]
    fn test_action_sequence_lists_tools() {
        let builder = ReplanPromptBuilder::new(vec!["a_x".to_string(), "b_y".to_string()]);
        let prompt = builder.action_sequence(&json!({}), &json!({}));
        assert!(prompt.contains("a_x, b_y"));
    }

    #[test]
    fn test_phase_templates_have_placeholders() {
        assert!(PLANNING.contains("{task}"));
        assert!(PLANNING.contains("{tools}"));
        assert!(ACTION.contains("{action}"));
        assert!(REFLECTION.contains("{results}"));
        assert!(VERIFICATION.contains("{criteria}"));
        assert!(UNDERSTANDING.contains("{task}"));
    }
}
