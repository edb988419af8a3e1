//! Pre-planning: task understanding and information collection.
//!
//! Before planning, the model scores its understanding of the request and
//! enumerates the information it needs. Collection failures fall back to
//! assumptions, except for items touching the non-assumable keyword set,
//! which become information gaps instead.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::Result;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::PrePlanningConfig;
use crate::llm::{ChatMessage, LlmClient};
use crate::mcp::ToolCaller;

use super::parse::extract_json;
use super::prompts;

/// Items whose descriptions touch these keywords are never substituted by
/// assumptions.
const NON_ASSUMABLE_KEYWORDS: &[&str] = &[
    "security",
    "secret",
    "password",
    "token",
    "credential",
    "api_key",
    "database",
    "connection_string",
    "pii",
];

/// Confidence assigned to an item's own declared default assumption.
const DEFAULT_ASSUMPTION_CONFIDENCE: f64 = 0.7;

/// Everything pre-planning learned, feeding the planning prompt.
#[derive(Debug, Clone, Default)]
pub struct PrePlanningResult {
    pub understanding: Value,
    pub collection_plan: Value,
    pub collected: Vec<Value>,
    pub assumptions: Vec<Value>,
    pub information_gaps: Vec<Value>,
}

impl PrePlanningResult {
    /// Render for inclusion in the planning prompt.
    pub fn context_value(&self) -> Value {
        json!({
            "understanding": self.understanding,
            "collected_information": self.collected,
            "assumptions": self.assumptions,
            "information_gaps": self.information_gaps,
        })
    }
}

/// Understanding and information-collection sub-phases.
pub struct PrePlanningManager {
    config: PrePlanningConfig,
}

impl PrePlanningManager {
    pub fn new(config: PrePlanningConfig) -> Self {
        Self { config }
    }

    /// Run understanding, collection planning and collection.
    pub async fn execute(
        &self,
        llm: &Arc<dyn LlmClient>,
        tools: &HashMap<String, Arc<dyn ToolCaller>>,
        task_info: &str,
    ) -> Result<PrePlanningResult> {
        let mut result = PrePlanningResult {
            understanding: self.run_understanding(llm, task_info).await,
            ..Default::default()
        };

        if !self.config.enabled {
            return Ok(result);
        }

        result.collection_plan = self.run_collection_planning(llm, tools, &result.understanding).await;
        if result.collection_plan.get("skip_collection").and_then(Value::as_bool) == Some(true) {
            info!("execute: collection skipped by plan");
            return Ok(result);
        }

        self.run_collection(llm, tools, &mut result).await;
        info!(
            collected = result.collected.len(),
            assumptions = result.assumptions.len(),
            gaps = result.information_gaps.len(),
            "execute: collection finished"
        );
        Ok(result)
    }

    /// Understanding sub-phase; parse failure falls back to a minimal
    /// record with confidence 0.3.
    async fn run_understanding(&self, llm: &Arc<dyn LlmClient>, task_info: &str) -> Value {
        let prompt = prompts::UNDERSTANDING.replace("{task}", task_info);
        let parsed = match llm.chat(&[ChatMessage::user(prompt)]).await {
            Ok(response) => extract_json(&response.content),
            Err(e) => {
                warn!(error = %e, "run_understanding: model call failed");
                None
            }
        };

        parsed.unwrap_or_else(|| {
            warn!("run_understanding: falling back to minimal understanding");
            let goal: String = task_info.chars().take(200).collect();
            json!({
                "task_type": "other",
                "primary_goal": goal,
                "expected_deliverables": [],
                "constraints": [],
                "scope": "unknown",
                "understanding_confidence": 0.3,
                "ambiguities": ["understanding could not be parsed"],
            })
        })
    }

    async fn run_collection_planning(
        &self,
        llm: &Arc<dyn LlmClient>,
        tools: &HashMap<String, Arc<dyn ToolCaller>>,
        understanding: &Value,
    ) -> Value {
        let tool_list = available_tools_text(tools);
        let prompt = prompts::COLLECTION_PLANNING
            .replace("{understanding}", &understanding.to_string())
            .replace("{tools}", &tool_list);

        let parsed = match llm.chat(&[ChatMessage::user(prompt)]).await {
            Ok(response) => extract_json(&response.content),
            Err(e) => {
                warn!(error = %e, "run_collection_planning: model call failed");
                None
            }
        };

        parsed.unwrap_or_else(|| json!({"skip_collection": true, "required_information": []}))
    }

    async fn run_collection(
        &self,
        llm: &Arc<dyn LlmClient>,
        tools: &HashMap<String, Arc<dyn ToolCaller>>,
        result: &mut PrePlanningResult,
    ) {
        let items = result
            .collection_plan
            .get("required_information")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let order: Vec<String> = result
            .collection_plan
            .get("collection_order")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_else(|| {
                items
                    .iter()
                    .filter_map(|i| i.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            });

        for id in order {
            let Some(item) = items.iter().find(|i| i.get("id").and_then(Value::as_str) == Some(id.as_str())) else {
                continue;
            };

            match self.collect_single(tools, item).await {
                Ok(content) => {
                    result.collected.push(json!({
                        "id": id,
                        "status": "collected",
                        "content": content,
                    }));
                }
                Err(failure) => {
                    if is_non_assumable(item) {
                        warn!(id, "run_collection: non-assumable item failed, recording gap");
                        result.information_gaps.push(json!({
                            "id": id,
                            "reason": "collection failed and the item is not assumable",
                            "failure": failure,
                        }));
                        continue;
                    }
                    self.make_assumption(llm, item, &id, &failure, result).await;
                }
            }
        }
    }

    /// One item, retried per the configured budget.
    async fn collect_single(&self, tools: &HashMap<String, Arc<dyn ToolCaller>>, item: &Value) -> Result<String, String> {
        let method = item.get("collection_method").cloned().unwrap_or(Value::Null);
        let tool_name = method.get("tool").and_then(Value::as_str).unwrap_or_default();
        let parameters = method.get("parameters").cloned().unwrap_or(json!({}));

        let Some((server, tool)) = split_tool_name(tools, tool_name) else {
            return Err(format!("unknown tool: {tool_name}"));
        };
        let client = &tools[&server];

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_retries_per_tool.max(1) {
            let outcome = client.call(&tool, parameters.clone()).await;
            if outcome.success {
                debug!(tool = tool_name, attempt, "collect_single: collected");
                return Ok(outcome.content);
            }
            last_error = outcome.error.unwrap_or_else(|| "tool call failed".to_string());
            debug!(tool = tool_name, attempt, error = %last_error, "collect_single: attempt failed");
        }
        Err(last_error)
    }

    /// Build an assumption for a failed item; low-confidence assumptions
    /// become information gaps rather than being used.
    async fn make_assumption(
        &self,
        llm: &Arc<dyn LlmClient>,
        item: &Value,
        id: &str,
        failure: &str,
        result: &mut PrePlanningResult,
    ) {
        let (assumption, confidence) = match item.get("default_assumption").and_then(Value::as_str) {
            Some(default) if !default.is_empty() => (default.to_string(), DEFAULT_ASSUMPTION_CONFIDENCE),
            _ => {
                let prompt = prompts::ASSUMPTION
                    .replace("{item}", &item.to_string())
                    .replace("{failure}", failure);
                match llm.chat(&[ChatMessage::user(prompt)]).await {
                    Ok(response) => match extract_json(&response.content) {
                        Some(value) => (
                            value
                                .get("assumption")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
                        ),
                        None => (String::new(), 0.0),
                    },
                    Err(_) => (String::new(), 0.0),
                }
            }
        };

        if assumption.is_empty() || confidence < self.config.confidence_threshold {
            result.information_gaps.push(json!({
                "id": id,
                "reason": format!("assumption confidence {confidence:.2} below threshold"),
                "failure": failure,
            }));
        } else {
            result.assumptions.push(json!({
                "id": id,
                "assumption": assumption,
                "confidence": confidence,
            }));
        }
    }
}

/// "`<server>_<tool>`" resolved against the known server set. Server names
/// may themselves contain underscores, so match the longest known prefix.
fn split_tool_name(tools: &HashMap<String, Arc<dyn ToolCaller>>, name: &str) -> Option<(String, String)> {
    let mut best: Option<(String, String)> = None;
    for server in tools.keys() {
        if let Some(rest) = name.strip_prefix(&format!("{server}_"))
            && best.as_ref().is_none_or(|(s, _)| server.len() > s.len())
        {
            best = Some((server.clone(), rest.to_string()));
        }
    }
    best
}

fn available_tools_text(tools: &HashMap<String, Arc<dyn ToolCaller>>) -> String {
    let mut names: Vec<String> = tools
        .values()
        .flat_map(|client| {
            client
                .schemas()
                .into_iter()
                .filter_map(|s| s.get("name").and_then(Value::as_str).map(str::to_string))
        })
        .collect();
    names.sort();
    names.join(", ")
}

fn is_non_assumable(item: &Value) -> bool {
    let haystack = format!(
        "{} {} {}",
        item.get("id").and_then(Value::as_str).unwrap_or_default(),
        item.get("category").and_then(Value::as_str).unwrap_or_default(),
        item.get("description").and_then(Value::as_str).unwrap_or_default(),
    )
    .to_lowercase();
    NON_ASSUMABLE_KEYWORDS.iter().any(|k| haystack.contains(k))
}
