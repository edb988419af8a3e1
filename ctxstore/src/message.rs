//! Message storage for file-based context management.
//!
//! Two files per run: `messages.jsonl` carries the full audit history with
//! sequence numbers and token counts; `current.jsonl` carries the live
//! context window in the chat-completion shape the model consumes. Old
//! current-window records may be replaced by a synthetic summary record;
//! the audit log is never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::estimate::estimate_tokens;

/// A full audit record in `messages.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Strictly monotonic per run, starting at 1
    pub seq: u64,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Estimated tokens for this message
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// A chat-completion-shaped record in `current.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<serde_json::Value>,
}

impl CurrentMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_name: None,
            function_call: None,
        }
    }

    pub fn with_tool(role: impl Into<String>, content: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_name: Some(tool_name.into()),
            function_call: None,
        }
    }
}

/// File-based message storage without in-memory caching.
pub struct MessageStore {
    context_dir: PathBuf,
    messages_file: PathBuf,
    current_file: PathBuf,
}

impl MessageStore {
    pub fn new(context_dir: impl AsRef<Path>) -> Self {
        let context_dir = context_dir.as_ref().to_path_buf();
        Self {
            messages_file: context_dir.join("messages.jsonl"),
            current_file: context_dir.join("current.jsonl"),
            context_dir,
        }
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    /// Append a message to both the audit log and the current window.
    ///
    /// The audit log is written first and is authoritative; a crash between
    /// the two writes is healed by [`MessageStore::reconcile_current`].
    /// Returns the assigned sequence number.
    pub fn add_message(&self, role: &str, content: &str, tool_name: Option<&str>) -> Result<u64> {
        let seq = self.next_seq()?;
        let tokens = estimate_tokens(content);

        let stored = StoredMessage {
            seq,
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            tokens,
            tool_name: tool_name.map(str::to_string),
        };
        append_line(&self.messages_file, &stored)?;

        let current = CurrentMessage {
            role: role.to_string(),
            content: content.to_string(),
            tool_name: tool_name.map(str::to_string),
            function_call: None,
        };
        append_line(&self.current_file, &current)?;

        debug!(seq, role, tokens, "add_message: appended");
        Ok(seq)
    }

    /// Sum of stored token counts for the last N audit records, where N is
    /// the line count of `current.jsonl`. Zero when the window is empty.
    pub fn current_token_count(&self) -> Result<u64> {
        let current_count = count_lines(&self.current_file)?;
        if current_count == 0 {
            return Ok(0);
        }

        let messages = self.read_messages()?;
        let skip = messages.len().saturating_sub(current_count);
        Ok(messages.iter().skip(skip).map(|m| m.tokens).sum())
    }

    /// Total records in the audit log.
    pub fn count_messages(&self) -> Result<usize> {
        count_lines(&self.messages_file)
    }

    /// Highest assigned sequence number, 0 when the log is empty.
    pub fn max_seq(&self) -> Result<u64> {
        Ok(self.read_messages()?.iter().map(|m| m.seq).max().unwrap_or(0))
    }

    /// Read the whole audit log.
    pub fn read_messages(&self) -> Result<Vec<StoredMessage>> {
        read_jsonl(&self.messages_file)
    }

    /// Read the live context window.
    pub fn read_current(&self) -> Result<Vec<CurrentMessage>> {
        read_jsonl(&self.current_file)
    }

    /// Rewrite the current window as one synthetic assistant summary record
    /// followed by the preserved tail, and append the summary to the audit
    /// log so history stays linear. Returns the summary's sequence number.
    pub fn replace_current(&self, summary_text: &str, summary_tokens: u64, tail: &[CurrentMessage]) -> Result<u64> {
        let tmp = self.context_dir.join("current.jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp).context("Failed to create replacement current window")?;
            let summary = CurrentMessage::new("assistant", summary_text);
            writeln!(file, "{}", serde_json::to_string(&summary)?)?;
            for message in tail {
                writeln!(file, "{}", serde_json::to_string(message)?)?;
            }
            file.flush()?;
        }
        fs::rename(&tmp, &self.current_file).context("Failed to swap current window")?;

        let seq = self.next_seq()?;
        let stored = StoredMessage {
            seq,
            role: "assistant".to_string(),
            content: summary_text.to_string(),
            timestamp: Utc::now(),
            tokens: summary_tokens,
            tool_name: None,
        };
        append_line(&self.messages_file, &stored)?;

        debug!(seq, tail_len = tail.len(), "replace_current: window rewritten");
        Ok(seq)
    }

    /// Heal the current window after a crash between the paired appends.
    ///
    /// When the audit log carries exactly one record more than the last
    /// current-window write accounted for, the missing record is re-appended.
    /// Returns the number of records appended.
    pub fn reconcile_current(&self) -> Result<usize> {
        let messages = self.read_messages()?;
        let current = self.read_current()?;

        if messages.is_empty() {
            return Ok(0);
        }

        let last_message = &messages[messages.len() - 1];
        let needs_append = match current.last() {
            Some(last_current) => last_current.role != last_message.role || last_current.content != last_message.content,
            None => true,
        };

        if !needs_append {
            return Ok(0);
        }

        let record = CurrentMessage {
            role: last_message.role.clone(),
            content: last_message.content.clone(),
            tool_name: last_message.tool_name.clone(),
            function_call: None,
        };
        append_line(&self.current_file, &record)?;
        debug!(seq = last_message.seq, "reconcile_current: re-appended trailing record");
        Ok(1)
    }

    fn next_seq(&self) -> Result<u64> {
        Ok(self.max_seq()? + 1)
    }
}

/// Append one serialized record to a JSONL file, flushed.
pub(crate) fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    file.flush()?;
    Ok(())
}

/// Read all records of a JSONL file; missing file reads as empty.
pub(crate) fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = fs::File::open(path).context(format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).context(format!("Malformed record in {}", path.display()))?);
    }
    Ok(records)
}

pub(crate) fn count_lines(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let file = fs::File::open(path)?;
    Ok(BufReader::new(file).lines().count())
}
