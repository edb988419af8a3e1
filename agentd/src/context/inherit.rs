//! Cross-run context inheritance.
//!
//! A new attempt on a key that was completed or stopped before inherits the
//! prior run's final summary as seed context, bounded by a TTL and a token
//! budget.

use chrono::{DateTime, Duration, Utc};
use eyre::{Result, eyre};
use tracing::{debug, info};

use ctxstore::{ContextLayout, RunState, SummaryStore};

use crate::config::InheritanceConfig;
use crate::db::DbHandle;
use crate::domain::TaskKey;
use crate::llm::ChatMessage;

/// Seed context adopted from a prior run.
#[derive(Debug, Clone)]
pub struct InheritedContext {
    pub previous_uuid: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: String,
    /// Messages the coordinator prepends before the user request
    pub seed_messages: Vec<ChatMessage>,
}

/// Locates prior runs of a key and builds the seed messages.
pub struct ContextInheritanceManager {
    layout: ContextLayout,
    db: DbHandle,
    enabled: bool,
    expiry_days: i64,
    max_inherited_tokens: usize,
}

impl ContextInheritanceManager {
    pub fn new(layout: ContextLayout, db: DbHandle, config: &InheritanceConfig) -> Self {
        Self {
            layout,
            db,
            enabled: config.enabled,
            expiry_days: config.context_expiry_days,
            max_inherited_tokens: config.max_inherited_tokens,
        }
    }

    /// Find the newest completed/stopped run of the key within the TTL and
    /// build seed messages from its final summary. None when no candidate
    /// carries a summary.
    pub async fn inherit(&self, key: &TaskKey, user_request: &str) -> Result<Option<InheritedContext>> {
        if !self.enabled {
            return Ok(None);
        }

        let since = Utc::now() - Duration::days(self.expiry_days);
        let candidates = self
            .db
            .find_completed_by_key(key.db_parts(), Some(since))
            .await
            .map_err(|e| eyre!(e))?;

        for candidate in candidates {
            let Some(summary) = self.load_final_summary(&candidate.uuid) else {
                debug!(uuid = %candidate.uuid, "inherit: candidate has no final summary");
                continue;
            };

            let summary = self.truncate_summary(summary);
            let completed_text = candidate
                .completed_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let short_uuid = &candidate.uuid[..candidate.uuid.len().min(8)];

            let seed_messages = vec![
                ChatMessage::assistant(format!(
                    "Previous run summary: (from {short_uuid}, {completed_text})\n\n{summary}"
                )),
                ChatMessage::user(user_request),
            ];

            info!(key = %key, previous = %candidate.uuid, "inherit: adopting previous context");
            return Ok(Some(InheritedContext {
                previous_uuid: candidate.uuid,
                completed_at: candidate.completed_at,
                summary,
                seed_messages,
            }));
        }

        debug!(key = %key, "inherit: no candidate found");
        Ok(None)
    }

    /// Markdown notice posted on the issue when inheritance kicks in.
    pub fn notification_comment(&self, context: &InheritedContext) -> String {
        let completed_text = context
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let short_uuid = &context.previous_uuid[..context.previous_uuid.len().min(8)];

        format!(
            "📋 **Inherited context from a previous run**\n\n\
             - Source run: #{short_uuid}\n\
             - Completed: {completed_text}\n\
             - Inherited content: final summary\n\n\
             The previous run's results are taken into account for this request."
        )
    }

    fn load_final_summary(&self, uuid: &str) -> Option<String> {
        // Completed and stopped runs both live under completed/.
        let dir = self.layout.run_dir(RunState::Completed, uuid);
        let store = SummaryStore::new(&dir);
        store.latest().ok().flatten().map(|s| s.summary)
    }

    /// Enforce the inherited budget, measured in 4-char units, with a
    /// trailing ellipsis marker on truncation.
    fn truncate_summary(&self, summary: String) -> String {
        let char_budget = self.max_inherited_tokens * 4;
        if summary.chars().count() <= char_budget {
            return summary;
        }
        let mut truncated: String = summary.chars().take(char_budget).collect();
        truncated.push('…');
        truncated
    }
}
