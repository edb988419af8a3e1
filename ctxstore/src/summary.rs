//! Summary storage for context compression history.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::{append_line, read_jsonl};

/// One compression record in `summaries.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Monotonic from 1
    pub id: u64,
    /// First audit seq covered by this summary
    pub start_seq: u64,
    /// Last audit seq covered by this summary
    pub end_seq: u64,
    pub summary: String,
    pub original_tokens: u64,
    pub summary_tokens: u64,
    /// summary_tokens / original_tokens, 0.0 when nothing was summarized
    pub ratio: f64,
    pub timestamp: DateTime<Utc>,
}

/// File-based summarization history.
pub struct SummaryStore {
    summaries_file: PathBuf,
}

impl SummaryStore {
    pub fn new(context_dir: impl AsRef<Path>) -> Self {
        Self {
            summaries_file: context_dir.as_ref().join("summaries.jsonl"),
        }
    }

    /// Append a summary covering `[start_seq, end_seq]`. Returns its id.
    pub fn add_summary(
        &self,
        start_seq: u64,
        end_seq: u64,
        summary_text: &str,
        original_tokens: u64,
        summary_tokens: u64,
    ) -> Result<u64> {
        let id = self.next_id()?;
        let ratio = if original_tokens > 0 {
            summary_tokens as f64 / original_tokens as f64
        } else {
            0.0
        };

        let record = SummaryRecord {
            id,
            start_seq,
            end_seq,
            summary: summary_text.to_string(),
            original_tokens,
            summary_tokens,
            ratio,
            timestamp: Utc::now(),
        };
        append_line(&self.summaries_file, &record)?;

        debug!(id, start_seq, end_seq, ratio, "add_summary: recorded");
        Ok(id)
    }

    /// The most recently written summary, if any.
    pub fn latest(&self) -> Result<Option<SummaryRecord>> {
        Ok(self.read_all()?.into_iter().next_back())
    }

    pub fn read_all(&self) -> Result<Vec<SummaryRecord>> {
        read_jsonl(&self.summaries_file)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    fn next_id(&self) -> Result<u64> {
        Ok(self.read_all()?.iter().map(|s| s.id).max().unwrap_or(0) + 1)
    }
}
