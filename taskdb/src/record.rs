//! Task run records and the flattened task-key projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued, not yet picked up by a consumer
    #[default]
    Pending,
    /// Owned by a consumer, context directory under `running/`
    Running,
    /// Suspended by the pause signal, directory under `paused/`
    Paused,
    /// Stopped by assignee removal, directory under `completed/`
    Stopped,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal states move the directory to `completed/`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The flattened database projection of a task key.
///
/// GitHub keys fill `owner`/`repo`; GitLab keys fill `project_id`. `number`
/// carries the issue/PR number or the GitLab iid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKeyParts {
    pub task_source: String,
    pub task_type: String,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub project_id: Option<i64>,
    pub number: i64,
}

/// One row in the `tasks` table: a single run attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub uuid: String,
    pub task_source: String,
    pub task_type: String,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub project_id: Option<i64>,
    pub number: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub process_id: Option<i64>,
    pub hostname: Option<String>,
    pub llm_provider: Option<String>,
    pub model: Option<String>,
    pub context_length: Option<i64>,
    pub llm_call_count: i64,
    pub tool_call_count: i64,
    pub total_tokens: i64,
    pub compression_count: i64,
    pub error_message: Option<String>,
    pub user: Option<String>,
}

impl TaskRecord {
    /// A fresh pending record for one attempt on the given key.
    pub fn new_pending(uuid: impl Into<String>, parts: &TaskKeyParts, user: Option<&str>) -> Self {
        Self {
            uuid: uuid.into(),
            task_source: parts.task_source.clone(),
            task_type: parts.task_type.clone(),
            owner: parts.owner.clone(),
            repo: parts.repo.clone(),
            project_id: parts.project_id,
            number: parts.number,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            process_id: None,
            hostname: None,
            llm_provider: None,
            model: None,
            context_length: None,
            llm_call_count: 0,
            tool_call_count: 0,
            total_tokens: 0,
            compression_count: 0,
            error_message: None,
            user: user.map(str::to_string),
        }
    }

    pub fn key_parts(&self) -> TaskKeyParts {
        TaskKeyParts {
            task_source: self.task_source.clone(),
            task_type: self.task_type.clone(),
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            project_id: self.project_id,
            number: self.number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Stopped,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Stopped.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_new_pending_defaults() {
        let parts = TaskKeyParts {
            task_source: "github".to_string(),
            task_type: "issue".to_string(),
            owner: Some("acme".to_string()),
            repo: Some("svc".to_string()),
            project_id: None,
            number: 42,
        };
        let record = TaskRecord::new_pending("u-1", &parts, Some("alice"));

        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.llm_call_count, 0);
        assert!(record.started_at.is_none());
        assert_eq!(record.key_parts(), parts);
    }
}
