//! Run attempts.

use chrono::{DateTime, Utc};
use ctxstore::RunMetadata;
use taskdb::{TaskRecord, TaskStatus};
use uuid::Uuid;

use super::TaskKey;

/// One attempt at processing a task key.
///
/// A fresh attempt gets a fresh v4 uuid; a resumed attempt keeps the uuid of
/// the paused run it continues.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub uuid: String,
    pub key: TaskKey,
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_resumed: bool,
}

impl TaskRun {
    /// Start a fresh attempt.
    pub fn new(key: TaskKey, user: Option<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            key,
            user,
            created_at: Utc::now(),
            is_resumed: false,
        }
    }

    /// Continue a paused attempt under its original uuid.
    pub fn resumed(key: TaskKey, uuid: String, user: Option<String>) -> Self {
        Self {
            uuid,
            key,
            user,
            created_at: Utc::now(),
            is_resumed: true,
        }
    }

    /// The pending database row for this attempt.
    pub fn to_record(&self) -> TaskRecord {
        let mut record = TaskRecord::new_pending(&self.uuid, &self.key.db_parts(), self.user.as_deref());
        record.process_id = Some(std::process::id() as i64);
        record.hostname = hostname::get().ok().and_then(|h| h.into_string().ok());
        record
    }

    /// The initial `metadata.json` descriptor for this attempt.
    pub fn to_metadata(&self, provider: &str, model: &str, context_length: u64) -> RunMetadata {
        RunMetadata {
            uuid: self.uuid.clone(),
            task_key: self.key.to_dict(),
            user: self.user.clone(),
            status: TaskStatus::Running.to_string(),
            created_at: self.created_at,
            started_at: Some(Utc::now()),
            completed_at: None,
            process_id: Some(std::process::id()),
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
            llm_provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            context_length: Some(context_length),
            llm_call_count: 0,
            tool_call_count: 0,
            total_tokens: 0,
            compression_count: 0,
            error_message: None,
            is_resumed: self.is_resumed,
            resume_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TaskKey {
        TaskKey::GithubIssue {
            owner: "acme".to_string(),
            repo: "svc".to_string(),
            number: 42,
        }
    }

    #[test]
    fn test_fresh_attempts_get_distinct_uuids() {
        let a = TaskRun::new(key(), None);
        let b = TaskRun::new(key(), None);
        assert_ne!(a.uuid, b.uuid);
        assert!(!a.is_resumed);
    }

    #[test]
    fn test_resumed_keeps_uuid() {
        let run = TaskRun::resumed(key(), "fixed-uuid".to_string(), Some("alice".to_string()));
        assert_eq!(run.uuid, "fixed-uuid");
        assert!(run.is_resumed);
    }

    #[test]
    fn test_record_projection() {
        let run = TaskRun::new(key(), Some("alice".to_string()));
        let record = run.to_record();
        assert_eq!(record.uuid, run.uuid);
        assert_eq!(record.owner.as_deref(), Some("acme"));
        assert_eq!(record.user.as_deref(), Some("alice"));
        assert!(record.process_id.is_some());
    }

    #[test]
    fn test_metadata_projection() {
        let run = TaskRun::new(key(), None);
        let metadata = run.to_metadata("openai", "gpt-4o", 128_000);
        assert_eq!(metadata.uuid, run.uuid);
        assert_eq!(metadata.status, "running");
        assert_eq!(metadata.context_length, Some(128_000));
        assert!(!metadata.is_resumed);
    }
}
