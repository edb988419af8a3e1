//! Replan budgeting and gating.
//!
//! Every phase output may trigger a model-judged replan. The manager gates
//! each decision against per-phase and total budgets, a confidence floor,
//! and an identical-trigger loop detector; every decision is recorded to
//! the planning history with whether it executed and why not.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ctxstore::PlanningHistoryStore;

use crate::config::ReplanningConfig;
use crate::llm::{ChatMessage, LlmClient};

use super::decision::{ReplanDecision, ReplanType};
use super::parse::extract_json;
use super::prompts::ReplanPromptBuilder;

/// What the gate decided about one replan request.
#[derive(Debug, Clone)]
pub struct ReplanVerdict {
    pub execute: bool,
    pub override_reason: String,
}

/// Per-phase replan counters.
#[derive(Debug, Clone, Default)]
pub struct ReplanCounters {
    pub goal_understanding: u32,
    pub task_decomposition: u32,
    pub action_sequence: u32,
    pub execution_retry: u32,
    pub execution_partial: u32,
    pub reflection: u32,
    pub total: u32,
}

impl ReplanCounters {
    fn to_value(&self) -> Value {
        json!({
            "goal_understanding": self.goal_understanding,
            "task_decomposition": self.task_decomposition,
            "action_sequence": self.action_sequence,
            "execution_retry": self.execution_retry,
            "execution_partial": self.execution_partial,
            "reflection": self.reflection,
            "total": self.total,
        })
    }
}

/// Scores and budgets replan decisions per phase.
pub struct ReplanManager {
    config: ReplanningConfig,
    counters: ReplanCounters,
    trigger_history: Vec<String>,
    prompt_builder: ReplanPromptBuilder,
}

impl ReplanManager {
    pub fn new(config: ReplanningConfig, available_tools: Vec<String>) -> Self {
        Self {
            config,
            counters: ReplanCounters::default(),
            trigger_history: Vec::new(),
            prompt_builder: ReplanPromptBuilder::new(available_tools),
        }
    }

    pub fn counters(&self) -> &ReplanCounters {
        &self.counters
    }

    pub fn prompts(&self) -> &ReplanPromptBuilder {
        &self.prompt_builder
    }

    /// Ask the model for a replan verdict on a phase output. Parse failures
    /// decode to the no-replan default.
    pub async fn decide(&self, llm: &Arc<dyn LlmClient>, prompt: String) -> ReplanDecision {
        if !self.config.enabled {
            return ReplanDecision::default();
        }

        match llm.chat(&[ChatMessage::user(prompt)]).await {
            Ok(response) => match extract_json(&response.content) {
                Some(value) => ReplanDecision::from_value(&value),
                None => {
                    warn!("decide: unparseable replan response");
                    ReplanDecision::default()
                }
            },
            Err(e) => {
                warn!(error = %e, "decide: replan request failed");
                ReplanDecision::default()
            }
        }
    }

    /// Gate a decision, bumping counters and trigger history when it
    /// executes. Records the outcome to the planning history.
    pub fn evaluate_and_record(
        &mut self,
        history: &PlanningHistoryStore,
        phase: &str,
        decision: &ReplanDecision,
    ) -> ReplanVerdict {
        let verdict = self.evaluate(phase, decision);
        if let Err(e) = history.save_replan_decision(json!({
            "phase": phase,
            "llm_decision": decision.to_value(),
            "confidence": decision.confidence,
            "executed": verdict.execute,
            "override_reason": verdict.override_reason,
            "replan_counts": self.counters.to_value(),
        })) {
            warn!(error = %e, "evaluate_and_record: history write failed");
        }
        verdict
    }

    fn evaluate(&mut self, phase: &str, decision: &ReplanDecision) -> ReplanVerdict {
        if !self.config.enabled || !decision.replan_needed {
            return ReplanVerdict {
                execute: false,
                override_reason: String::new(),
            };
        }

        // Too uncertain to act on at all.
        if decision.confidence < self.config.user_confirmation_threshold {
            let reason = format!("confidence too low ({:.2})", decision.confidence);
            warn!(phase, %reason, "evaluate: overriding replan");
            return ReplanVerdict {
                execute: false,
                override_reason: reason,
            };
        }

        // Identical (target_phase, replan_type) triggers repeating.
        let trigger_key = decision.trigger_key();
        let trigger_count = self.trigger_history.iter().filter(|t| **t == trigger_key).count() as u32;
        if trigger_count >= self.config.same_trigger_max_count {
            let reason = format!("infinite loop detected: trigger {trigger_key} recorded {trigger_count} times");
            warn!(phase, %reason, "evaluate: overriding replan");
            return ReplanVerdict {
                execute: false,
                override_reason: reason,
            };
        }

        // Budgets.
        if self.counters.total >= self.config.max_total_replans {
            let reason = format!("total replan cap reached ({})", self.config.max_total_replans);
            warn!(phase, %reason, "evaluate: overriding replan");
            return ReplanVerdict {
                execute: false,
                override_reason: reason,
            };
        }
        let phase_key = phase_counter_key(phase, &decision.replan_type);
        let (count, cap) = self.phase_budget(&phase_key);
        if count >= cap {
            let reason = format!("phase replan cap reached for {phase_key} ({cap})");
            warn!(phase, %reason, "evaluate: overriding replan");
            return ReplanVerdict {
                execute: false,
                override_reason: reason,
            };
        }

        // Confident enough to execute?
        if decision.confidence < self.config.min_confidence {
            let reason = format!(
                "confidence {:.2} below execution threshold {:.2}",
                decision.confidence, self.config.min_confidence
            );
            debug!(phase, %reason, "evaluate: skipping replan");
            return ReplanVerdict {
                execute: false,
                override_reason: reason,
            };
        }

        self.bump(&phase_key);
        self.trigger_history.push(trigger_key);
        info!(
            phase,
            replan_type = %decision.replan_type,
            level = decision.replan_level,
            total = self.counters.total,
            "evaluate: executing replan"
        );
        ReplanVerdict {
            execute: true,
            override_reason: String::new(),
        }
    }

    fn phase_budget(&self, phase_key: &str) -> (u32, u32) {
        match phase_key {
            "goal_understanding" => (self.counters.goal_understanding, self.config.max_clarification_requests),
            "task_decomposition" => (self.counters.task_decomposition, self.config.max_redecomposition_attempts),
            "action_sequence" => (self.counters.action_sequence, self.config.max_regeneration_attempts),
            "execution_retry" => (self.counters.execution_retry, self.config.max_action_retries),
            "execution_partial" => (self.counters.execution_partial, self.config.max_partial_replans),
            "reflection" => (self.counters.reflection, self.config.max_plan_revisions),
            _ => (0, u32::MAX),
        }
    }

    fn bump(&mut self, phase_key: &str) {
        self.counters.total += 1;
        match phase_key {
            "goal_understanding" => self.counters.goal_understanding += 1,
            "task_decomposition" => self.counters.task_decomposition += 1,
            "action_sequence" => self.counters.action_sequence += 1,
            "execution_retry" => self.counters.execution_retry += 1,
            "execution_partial" => self.counters.execution_partial += 1,
            "reflection" => self.counters.reflection += 1,
            _ => {}
        }
    }

    /// Reset all counters (fresh plan from scratch).
    pub fn reset(&mut self) {
        self.counters = ReplanCounters::default();
        self.trigger_history.clear();
        info!("reset: replan counters cleared");
    }
}

/// Execution-phase decisions split into retry and partial budgets.
fn phase_counter_key(phase: &str, replan_type: &str) -> String {
    if phase == "execution" {
        if ReplanType::parse(replan_type) == Some(ReplanType::Retry) {
            "execution_retry".to_string()
        } else {
            "execution_partial".to_string()
        }
    } else {
        phase.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn decision(confidence: f64) -> ReplanDecision {
        ReplanDecision {
            replan_needed: true,
            confidence,
            replan_type: "partial_replan".to_string(),
            target_phase: "execution".to_string(),
            replan_level: 2,
            ..Default::default()
        }
    }

    fn history(temp: &TempDir) -> PlanningHistoryStore {
        PlanningHistoryStore::new(temp.path().join("planning"), "test-uuid").unwrap()
    }

    #[test]
    fn test_not_needed_proceeds() {
        let mut manager = ReplanManager::new(ReplanningConfig::default(), vec![]);
        let verdict = manager.evaluate("execution", &ReplanDecision::default());
        assert!(!verdict.execute);
        assert!(verdict.override_reason.is_empty());
    }

    #[test]
    fn test_low_confidence_overridden() {
        let mut manager = ReplanManager::new(ReplanningConfig::default(), vec![]);
        let verdict = manager.evaluate("execution", &decision(0.2));
        assert!(!verdict.execute);
        assert!(verdict.override_reason.contains("confidence too low"));
    }

    #[test]
    fn test_mid_confidence_skipped_not_executed() {
        let mut manager = ReplanManager::new(ReplanningConfig::default(), vec![]);
        let verdict = manager.evaluate("execution", &decision(0.4));
        assert!(!verdict.execute);
        assert!(verdict.override_reason.contains("below execution threshold"));
        assert_eq!(manager.counters().total, 0);
    }

    #[test]
    fn test_confident_decision_executes_and_counts() {
        let mut manager = ReplanManager::new(ReplanningConfig::default(), vec![]);
        let verdict = manager.evaluate("execution", &decision(0.9));
        assert!(verdict.execute);
        assert_eq!(manager.counters().total, 1);
        assert_eq!(manager.counters().execution_partial, 1);
    }

    #[test]
    fn test_retry_type_uses_retry_budget() {
        let mut manager = ReplanManager::new(ReplanningConfig::default(), vec![]);
        let mut retry = decision(0.9);
        retry.replan_type = "retry".to_string();
        manager.evaluate("execution", &retry);
        assert_eq!(manager.counters().execution_retry, 1);
        assert_eq!(manager.counters().execution_partial, 0);
    }

    #[test]
    fn test_total_cap_overrides() {
        let config = ReplanningConfig {
            max_total_replans: 2,
            same_trigger_max_count: 10,
            ..Default::default()
        };
        let mut manager = ReplanManager::new(config, vec![]);

        assert!(manager.evaluate("execution", &decision(0.9)).execute);
        assert!(manager.evaluate("execution", &decision(0.9)).execute);
        let third = manager.evaluate("execution", &decision(0.9));
        assert!(!third.execute);
        assert!(third.override_reason.contains("total replan cap"));
        assert_eq!(manager.counters().total, 2);
    }

    #[test]
    fn test_same_trigger_loop_detected() {
        // Default same_trigger_max_count = 2
        let config = ReplanningConfig {
            max_partial_replans: 10,
            max_total_replans: 10,
            ..Default::default()
        };
        let mut manager = ReplanManager::new(config, vec![]);

        assert!(manager.evaluate("execution", &decision(0.9)).execute);
        assert!(manager.evaluate("execution", &decision(0.9)).execute);
        let third = manager.evaluate("execution", &decision(0.9));
        assert!(!third.execute);
        assert!(third.override_reason.contains("infinite loop detected"));
    }

    #[test]
    fn test_phase_cap_overrides() {
        let config = ReplanningConfig {
            max_partial_replans: 1,
            same_trigger_max_count: 10,
            ..Default::default()
        };
        let mut manager = ReplanManager::new(config, vec![]);

        assert!(manager.evaluate("execution", &decision(0.9)).execute);
        let second = manager.evaluate("execution", &decision(0.9));
        assert!(!second.execute);
        assert!(second.override_reason.contains("execution_partial"));
    }

    #[test]
    fn test_record_includes_executed_and_counts() {
        let temp = TempDir::new().unwrap();
        let history = history(&temp);
        let config = ReplanningConfig {
            max_total_replans: 1,
            same_trigger_max_count: 10,
            ..Default::default()
        };
        let mut manager = ReplanManager::new(config, vec![]);

        manager.evaluate_and_record(&history, "execution", &decision(0.9));
        manager.evaluate_and_record(&history, "execution", &decision(0.9));

        let entries = history.replan_decisions().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["executed"], true);
        assert_eq!(entries[1]["executed"], false);
        assert!(entries[1]["override_reason"].as_str().unwrap().contains("total replan cap"));
        assert_eq!(entries[1]["replan_counts"]["total"], 1);
    }

    #[test]
    fn test_disabled_never_replans() {
        let config = ReplanningConfig {
            enabled: false,
            ..Default::default()
        };
        let mut manager = ReplanManager::new(config, vec![]);
        assert!(!manager.evaluate("execution", &decision(0.99)).execute);
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut manager = ReplanManager::new(ReplanningConfig::default(), vec![]);
        manager.evaluate("execution", &decision(0.9));
        manager.reset();
        assert_eq!(manager.counters().total, 0);
    }
}
