//! Progress checklist comments.
//!
//! The action plan is posted to the issue/MR as a Markdown checklist under
//! a well-known header; each completed action flips its box and updates the
//! same comment when the tracker returned a comment id, otherwise a fresh
//! comment is posted.

use serde_json::Value;
use tracing::warn;

use crate::tracker::TrackedTask;

/// Well-known header; downstream automation parses it.
pub const PLAN_HEADER: &str = "## 📋 Execution Plan";

/// Tracks the plan comment across updates.
pub struct ProgressCommentManager {
    comment_id: Option<String>,
}

impl Default for ProgressCommentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCommentManager {
    pub fn new() -> Self {
        Self { comment_id: None }
    }

    /// Render the checklist with the first `completed` actions checked.
    pub fn build_checklist(actions: &[Value], completed: usize) -> String {
        let mut lines = vec![PLAN_HEADER.to_string(), String::new()];

        for (index, action) in actions.iter().enumerate() {
            let task_id = action
                .get("task_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("task_{}", index + 1));
            let purpose = action.get("purpose").and_then(Value::as_str).unwrap_or("Execute action");
            let checkbox = if index < completed { "[x]" } else { "[ ]" };
            lines.push(format!("- {checkbox} **{task_id}**: {purpose}"));
        }

        lines.push(String::new());
        if actions.is_empty() {
            lines.push("*No actions planned.*".to_string());
        } else if completed >= actions.len() {
            lines.push(format!("*✅ All {} tasks completed successfully!*", actions.len()));
        } else if completed == 0 {
            lines.push("*Progress will be updated as tasks complete.*".to_string());
        } else {
            let pct = completed * 100 / actions.len();
            lines.push(format!("*Progress: {}/{} ({}%) complete*", completed, actions.len(), pct));
        }

        lines.join("\n")
    }

    /// Post the initial checklist, remembering the comment id when the
    /// tracker exposes one.
    pub async fn post_plan(&mut self, task: &dyn TrackedTask, actions: &[Value]) {
        if actions.is_empty() {
            warn!("post_plan: no actions in plan, skipping checklist");
            return;
        }
        let content = Self::build_checklist(actions, 0);
        match task.comment(&content, false).await {
            Ok(id) => self.comment_id = id,
            Err(e) => warn!(error = %e, "post_plan: comment failed"),
        }
    }

    /// Flip boxes up to `completed`, editing the original comment when
    /// possible.
    pub async fn update_progress(&mut self, task: &dyn TrackedTask, actions: &[Value], completed: usize) {
        let content = Self::build_checklist(actions, completed);
        self.publish(task, &content).await;
    }

    /// Check every box.
    pub async fn mark_complete(&mut self, task: &dyn TrackedTask, actions: &[Value]) {
        let content = Self::build_checklist(actions, actions.len());
        self.publish(task, &content).await;
    }

    async fn publish(&mut self, task: &dyn TrackedTask, content: &str) {
        if let Some(comment_id) = self.comment_id.clone() {
            if task.update_comment(&comment_id, content).await.is_ok() {
                return;
            }
            warn!("publish: comment update failed, posting new comment");
        }
        match task.comment(content, false).await {
            Ok(id) => {
                if self.comment_id.is_none() {
                    self.comment_id = id;
                }
            }
            Err(e) => warn!(error = %e, "publish: comment failed"),
        }
    }
}
