//! Tool execution history storage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::{append_line, read_jsonl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    Error,
}

/// One record in `tools.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub seq: u64,
    pub tool: String,
    pub args: serde_json::Value,
    pub status: ToolCallStatus,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// File-based tool execution history.
pub struct ToolStore {
    tools_file: PathBuf,
}

impl ToolStore {
    pub fn new(context_dir: impl AsRef<Path>) -> Self {
        Self {
            tools_file: context_dir.as_ref().join("tools.jsonl"),
        }
    }

    /// Record one tool execution. Successful calls carry `result`, failed
    /// calls carry `error`. Returns the assigned sequence number.
    pub fn record(
        &self,
        tool: &str,
        args: serde_json::Value,
        status: ToolCallStatus,
        duration_ms: u64,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<u64> {
        let seq = self.next_seq()?;
        let record = ToolCallRecord {
            seq,
            tool: tool.to_string(),
            args,
            status,
            duration_ms,
            timestamp: Utc::now(),
            result: if status == ToolCallStatus::Success { result } else { None },
            error: if status == ToolCallStatus::Error { error } else { None },
        };
        append_line(&self.tools_file, &record)?;

        debug!(seq, tool, ?status, duration_ms, "record: tool call logged");
        Ok(seq)
    }

    pub fn read_all(&self) -> Result<Vec<ToolCallRecord>> {
        read_jsonl(&self.tools_file)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    fn next_seq(&self) -> Result<u64> {
        Ok(self.read_all()?.iter().map(|r| r.seq).max().unwrap_or(0) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_success_keeps_result_drops_error() {
        let temp = TempDir::new().unwrap();
        let store = ToolStore::new(temp.path());

        store
            .record(
                "github_get_issue",
                serde_json::json!({"number": 42}),
                ToolCallStatus::Success,
                120,
                Some("issue body".to_string()),
                Some("stale error".to_string()),
            )
            .unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records[0].result.as_deref(), Some("issue body"));
        assert!(records[0].error.is_none());
    }

    #[test]
    fn test_error_keeps_error_drops_result() {
        let temp = TempDir::new().unwrap();
        let store = ToolStore::new(temp.path());

        store
            .record(
                "executor_execute",
                serde_json::json!({"command": "npm test"}),
                ToolCallStatus::Error,
                30_000,
                Some("stale result".to_string()),
                Some("timeout".to_string()),
            )
            .unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records[0].error.as_deref(), Some("timeout"));
        assert!(records[0].result.is_none());
    }

    #[test]
    fn test_seq_monotonic() {
        let temp = TempDir::new().unwrap();
        let store = ToolStore::new(temp.path());

        for i in 0..5 {
            let seq = store
                .record("tool", serde_json::json!({}), ToolCallStatus::Success, i, None, None)
                .unwrap();
            assert_eq!(seq, i + 1);
        }
        assert_eq!(store.count().unwrap(), 5);
    }
}
