//! Planning history storage.
//!
//! One JSONL file per run under `planning/<uuid>.jsonl`, holding
//! heterogeneous entries tagged by `type`: plans, revisions, reflections,
//! replan decisions and verification results. The latest `plan` or
//! `revision` entry is the effective plan.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use eyre::{Context, Result};
use serde_json::{Value, json};
use tracing::debug;

use crate::message::{append_line, read_jsonl};

/// JSONL log of plans, reflections, revisions and replan decisions.
pub struct PlanningHistoryStore {
    task_uuid: String,
    filepath: PathBuf,
    /// Upstream issue/MR identifier for cross-run correlation
    issue_id: Option<String>,
}

impl PlanningHistoryStore {
    /// Create the store, making the planning directory if needed.
    pub fn new(planning_dir: impl AsRef<Path>, task_uuid: &str) -> Result<Self> {
        let planning_dir = planning_dir.as_ref();
        fs::create_dir_all(planning_dir).context("Failed to create planning directory")?;

        Ok(Self {
            task_uuid: task_uuid.to_string(),
            filepath: planning_dir.join(format!("{task_uuid}.jsonl")),
            issue_id: None,
        })
    }

    pub fn set_issue_id(&mut self, issue_id: impl Into<String>) {
        self.issue_id = Some(issue_id.into());
    }

    /// Save the initial plan.
    pub fn save_plan(&self, plan: &Value) -> Result<()> {
        self.append(json!({
            "type": "plan",
            "plan": plan,
        }))?;
        debug!(task_uuid = %self.task_uuid, "save_plan: recorded");
        Ok(())
    }

    /// Save a plan revision together with the reflection that triggered it.
    pub fn save_revision(&self, revised_plan: &Value, reflection: &Value) -> Result<()> {
        self.append(json!({
            "type": "revision",
            "reason": reflection.get("failure_reason").cloned().unwrap_or(Value::String("Plan revision needed".into())),
            "reflection": reflection,
            "updated_plan": revised_plan,
        }))?;
        debug!(task_uuid = %self.task_uuid, "save_revision: recorded");
        Ok(())
    }

    pub fn save_reflection(&self, reflection: &Value) -> Result<()> {
        self.append(json!({
            "type": "reflection",
            "evaluation": reflection,
        }))
    }

    /// Save a replan decision entry. The caller supplies the decision body
    /// including `executed` and `override_reason`.
    pub fn save_replan_decision(&self, mut entry: Value) -> Result<()> {
        if let Some(object) = entry.as_object_mut() {
            object.insert("type".into(), Value::String("replan_decision".into()));
        }
        self.append(entry)
    }

    pub fn save_verification(&self, verification: &Value) -> Result<()> {
        self.append(json!({
            "type": "verification",
            "verification": verification,
        }))
    }

    /// The effective plan: the most recent `plan` or `revision` entry.
    pub fn latest_plan(&self) -> Result<Option<Value>> {
        let entries = self.read_all()?;
        for entry in entries.into_iter().rev() {
            match entry.get("type").and_then(Value::as_str) {
                Some("plan") => return Ok(entry.get("plan").cloned()),
                Some("revision") => return Ok(entry.get("updated_plan").cloned()),
                _ => {}
            }
        }
        Ok(None)
    }

    pub fn has_plan(&self) -> Result<bool> {
        Ok(self.latest_plan()?.is_some())
    }

    pub fn replan_decisions(&self) -> Result<Vec<Value>> {
        self.entries_of_type("replan_decision")
    }

    pub fn reflections(&self) -> Result<Vec<Value>> {
        self.entries_of_type("reflection")
    }

    pub fn revisions(&self) -> Result<Vec<Value>> {
        self.entries_of_type("revision")
    }

    pub fn read_all(&self) -> Result<Vec<Value>> {
        read_jsonl(&self.filepath)
    }

    fn entries_of_type(&self, kind: &str) -> Result<Vec<Value>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.get("type").and_then(Value::as_str) == Some(kind))
            .collect())
    }

    fn append(&self, mut entry: Value) -> Result<()> {
        if let Some(object) = entry.as_object_mut() {
            object
                .entry("timestamp")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
            object.insert("task_uuid".into(), Value::String(self.task_uuid.clone()));
            if let Some(issue_id) = &self.issue_id {
                object.insert("issue_id".into(), Value::String(issue_id.clone()));
            }
        }
        append_line(&self.filepath, &entry)
    }
}
