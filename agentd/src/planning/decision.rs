//! Replan decision record.
//!
//! The model's replan verdict decodes into one fixed record covering the
//! union of fields across phases; absent fields take zero values. Control
//! flow keys off explicit booleans, never field presence.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replan kinds a decision may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanType {
    ClarificationRequest,
    GoalRevision,
    TaskRedecomposition,
    ActionRegeneration,
    PartialReplan,
    FullReplan,
    PlanRevision,
    Retry,
    None,
}

impl ReplanType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClarificationRequest => "clarification_request",
            Self::GoalRevision => "goal_revision",
            Self::TaskRedecomposition => "task_redecomposition",
            Self::ActionRegeneration => "action_regeneration",
            Self::PartialReplan => "partial_replan",
            Self::FullReplan => "full_replan",
            Self::PlanRevision => "plan_revision",
            Self::Retry => "retry",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clarification_request" => Some(Self::ClarificationRequest),
            "goal_revision" => Some(Self::GoalRevision),
            "task_redecomposition" => Some(Self::TaskRedecomposition),
            "action_regeneration" => Some(Self::ActionRegeneration),
            "partial_replan" => Some(Self::PartialReplan),
            "full_replan" => Some(Self::FullReplan),
            "plan_revision" => Some(Self::PlanRevision),
            "retry" => Some(Self::Retry),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Phases a replan can rewind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPhase {
    GoalUnderstanding,
    TaskDecomposition,
    ActionSequence,
    Execution,
    Reflection,
}

impl TargetPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoalUnderstanding => "goal_understanding",
            Self::TaskDecomposition => "task_decomposition",
            Self::ActionSequence => "action_sequence",
            Self::Execution => "execution",
            Self::Reflection => "reflection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "goal_understanding" => Some(Self::GoalUnderstanding),
            "task_decomposition" => Some(Self::TaskDecomposition),
            "action_sequence" => Some(Self::ActionSequence),
            "execution" => Some(Self::Execution),
            "reflection" => Some(Self::Reflection),
            _ => None,
        }
    }
}

/// The concrete rewind an executed replan maps to, one per replan level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindScope {
    /// Level 1: run the same action again
    RetryAction,
    /// Level 2: regenerate the action plan for the remaining work only
    RegenerateRemaining,
    /// Level 3: regenerate the entire action plan
    RegenerateActionPlan,
    /// Level 4: re-decompose subtasks under the existing goal
    Redecompose,
    /// Level 5: re-run goal understanding from scratch
    RerunGoalUnderstanding,
}

/// Model-assigned error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    Transient,
    Persistent,
    Fatal,
}

impl ErrorClassification {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "persistent" => Some(Self::Persistent),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// The model's replan verdict for one phase output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanDecision {
    pub replan_needed: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub replan_type: String,
    pub target_phase: String,
    /// 1 retry action, 2 regenerate remaining actions, 3 regenerate the
    /// whole action plan, 4 re-decompose, 5 re-run goal understanding
    pub replan_level: u8,
    pub issues_found: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub clarification_needed: bool,
    pub clarification_questions: Vec<String>,
    pub error_classification: String,
    pub recovery_strategy: String,
    pub affected_actions: Vec<String>,
    pub evaluation_result: String,
    pub achievement_rate: u8,
    pub additional_actions: Vec<Value>,
    pub assumptions_to_make: Vec<String>,
}

impl ReplanDecision {
    /// Decode from a parsed response. The verdict may be nested under a
    /// `replan_decision` key; both shapes are accepted. Malformed input
    /// decodes to the default (no replan).
    pub fn from_value(value: &Value) -> Self {
        let body = value.get("replan_decision").unwrap_or(value);
        serde_json::from_value(body.clone()).unwrap_or_default()
    }

    /// Serialize in the nested wire shape used by the history log.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "replan_decision": serde_json::to_value(self).expect("decision serializes"),
        })
    }

    /// Whether the decision itself asks for execution at the confidence bar.
    pub fn should_execute(&self, min_confidence: f64) -> bool {
        self.replan_needed && self.confidence >= min_confidence
    }

    /// Low-confidence or clarification-seeking decisions defer to a human.
    pub fn needs_user_confirmation(&self, threshold: f64) -> bool {
        self.clarification_needed || (self.replan_needed && self.confidence < threshold)
    }

    /// Trigger key for infinite-loop detection.
    pub fn trigger_key(&self) -> String {
        format!("{}:{}", self.target_phase, self.replan_type)
    }

    /// Map the decision onto its rewind. The explicit level wins; a missing
    /// level falls back to the target phase, then the replan type.
    pub fn rewind_scope(&self) -> RewindScope {
        match self.replan_level {
            1 => return RewindScope::RetryAction,
            2 => return RewindScope::RegenerateRemaining,
            3 => return RewindScope::RegenerateActionPlan,
            4 => return RewindScope::Redecompose,
            level if level >= 5 => return RewindScope::RerunGoalUnderstanding,
            _ => {}
        }

        if let Some(phase) = TargetPhase::parse(&self.target_phase) {
            return match phase {
                TargetPhase::GoalUnderstanding => RewindScope::RerunGoalUnderstanding,
                TargetPhase::TaskDecomposition => RewindScope::Redecompose,
                TargetPhase::ActionSequence => RewindScope::RegenerateActionPlan,
                TargetPhase::Execution => RewindScope::RetryAction,
                TargetPhase::Reflection => RewindScope::RegenerateRemaining,
            };
        }

        match ReplanType::parse(&self.replan_type) {
            Some(ReplanType::Retry) => RewindScope::RetryAction,
            Some(ReplanType::PartialReplan | ReplanType::ActionRegeneration | ReplanType::PlanRevision) => {
                RewindScope::RegenerateRemaining
            }
            Some(ReplanType::FullReplan) => RewindScope::RegenerateActionPlan,
            Some(ReplanType::TaskRedecomposition) => RewindScope::Redecompose,
            Some(ReplanType::GoalRevision | ReplanType::ClarificationRequest) => RewindScope::RerunGoalUnderstanding,
            _ => RewindScope::RetryAction,
        }
    }
}
