//! Token-threshold context compression.
//!
//! When the live window crosses the configured share of the context length,
//! everything except the most recent `keep_recent` messages is summarized
//! through the shared LLM client and replaced by one synthetic assistant
//! record. Compression is synchronous on the caller and must never abort
//! the run: LLM failures produce a diagnostic summary instead.

use std::sync::Arc;

use eyre::Result;
use tracing::{debug, info, warn};

use ctxstore::{CurrentMessage, MessageStore, SummaryStore, estimate_tokens};

use crate::config::ContextStorageConfig;
use crate::llm::{ChatMessage, LlmClient};

const DEFAULT_SUMMARY_PROMPT: &str = "You are an assistant that summarizes conversation history.\n\
Summarize the following messages concisely but completely.\n\n\
Include:\n\
1. Important decisions made\n\
2. Code changes performed\n\
3. Problems encountered and their resolutions\n\
4. Remaining work\n\n\
Aim for 30-40% of the original length.\n\n\
=== Messages to summarize ===\n\
{messages}\n\n\
Output only the summary.";

const DEFAULT_FINAL_SUMMARY_PROMPT: &str = "You are an assistant writing the final summary of a completed task.\n\
Summarize the entire conversation below so the next run on the same issue can\n\
pick up from it.\n\n\
Include:\n\
1. The task's goal and requirements\n\
2. Changes made (file names and a short description)\n\
3. Problems encountered and how they were resolved\n\
4. Important decisions and constraints\n\
5. Remaining work, if any\n\n\
Write so a future reader understands the whole run from this summary alone.\n\
Aim for 20-30% of the original length.\n\n\
=== Full conversation ===\n\
{messages}\n\n\
Output only the summary, no preamble.";

/// Threshold-driven summarizer over one run's message store.
pub struct ContextCompressor {
    llm: Arc<dyn LlmClient>,
    context_length: u64,
    compression_threshold: f64,
    keep_recent: usize,
    summary_prompt: String,
    final_summary_prompt: String,
}

impl ContextCompressor {
    pub fn new(llm: Arc<dyn LlmClient>, config: &ContextStorageConfig, context_length: u64) -> Self {
        Self {
            llm,
            context_length,
            compression_threshold: config.compression_threshold,
            keep_recent: config.keep_recent_messages,
            summary_prompt: config
                .summary_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SUMMARY_PROMPT.to_string()),
            final_summary_prompt: config
                .final_summary_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_FINAL_SUMMARY_PROMPT.to_string()),
        }
    }

    /// True when the live window exceeds `context_length * threshold`.
    pub fn should_compress(&self, messages: &MessageStore) -> Result<bool> {
        let current_tokens = messages.current_token_count()?;
        let threshold = self.context_length as f64 * self.compression_threshold;
        debug!(current_tokens, threshold, "should_compress: checked");
        Ok(current_tokens as f64 > threshold)
    }

    /// Compress the window prefix, preserving the `keep_recent` tail
    /// verbatim. Returns the summary id, or None when there is nothing to
    /// summarize.
    pub async fn compress(&self, messages: &MessageStore, summaries: &SummaryStore) -> Result<Option<u64>> {
        let current = messages.read_current()?;
        if current.len() <= self.keep_recent {
            debug!(window = current.len(), keep = self.keep_recent, "compress: window too small");
            return Ok(None);
        }

        let split = current.len() - self.keep_recent;
        let head = &current[..split];
        let tail = &current[split..];

        // Summary bands cover a contiguous prefix: pick up where the last
        // band ended.
        let start_seq = summaries.latest()?.map(|s| s.end_seq + 1).unwrap_or(1);
        let end_seq = messages.max_seq()?.saturating_sub(self.keep_recent as u64);
        if end_seq < start_seq {
            return Ok(None);
        }

        let original_tokens: u64 = head.iter().map(|m| estimate_tokens(&m.content)).sum();
        let summary_text = self.request_summary(&self.summary_prompt, head).await;
        let summary_tokens = estimate_tokens(&summary_text);

        let id = summaries.add_summary(start_seq, end_seq, &summary_text, original_tokens, summary_tokens)?;
        messages.replace_current(&summary_text, summary_tokens, tail)?;

        info!(id, start_seq, end_seq, original_tokens, summary_tokens, "compress: window compressed");
        Ok(Some(id))
    }

    /// Produce the completion-time summary over every message. The live
    /// window is left untouched; only `summaries.jsonl` grows.
    pub async fn final_summary(&self, messages: &MessageStore, summaries: &SummaryStore) -> Result<Option<u64>> {
        let all = messages.read_current()?;
        if all.is_empty() {
            return Ok(None);
        }

        let original_tokens: u64 = all.iter().map(|m| estimate_tokens(&m.content)).sum();
        let summary_text = self.request_summary(&self.final_summary_prompt, &all).await;
        let summary_tokens = estimate_tokens(&summary_text);

        let end_seq = messages.max_seq()?;
        let id = summaries.add_summary(1, end_seq, &summary_text, original_tokens, summary_tokens)?;

        info!(id, end_seq, "final_summary: recorded");
        Ok(Some(id))
    }

    /// Render the prompt and ask the model. Failures and empty replies are
    /// folded into a diagnostic summary; the run continues either way.
    async fn request_summary(&self, template: &str, head: &[CurrentMessage]) -> String {
        let mut rendered = String::new();
        for message in head {
            rendered.push_str(&format!("{}: {}\n\n", message.role, message.content));
        }
        let prompt = template.replace("{messages}", &rendered);

        match self.llm.chat(&[ChatMessage::user(prompt)]).await {
            Ok(response) => {
                let summary = response.content.trim().to_string();
                if summary.is_empty() {
                    warn!("request_summary: empty reply from model");
                    "[summary failure: empty response]".to_string()
                } else {
                    summary
                }
            }
            Err(e) => {
                warn!(error = %e, "request_summary: model call failed");
                format!("[summary failure: {e}]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmClient;
    use tempfile::TempDir;

    fn compressor(llm: MockLlmClient, context_length: u64) -> ContextCompressor {
        ContextCompressor::new(Arc::new(llm), &ContextStorageConfig::default(), context_length)
    }

    #[test]
    fn test_should_compress_threshold() {
        let temp = TempDir::new().unwrap();
        let messages = MessageStore::new(temp.path());
        // 40 ASCII chars -> 10 tokens
        messages.add_message("user", &"a".repeat(40), None).unwrap();

        // threshold = 100 * 0.7 = 70, 10 tokens -> no
        let c = compressor(MockLlmClient::from_texts(&[]), 100);
        assert!(!c.should_compress(&messages).unwrap());

        // threshold = 10 * 0.7 = 7, 10 tokens -> yes
        let c = compressor(MockLlmClient::from_texts(&[]), 10);
        assert!(c.should_compress(&messages).unwrap());
    }

    #[tokio::test]
    async fn test_compress_preserves_tail_and_audit() {
        let temp = TempDir::new().unwrap();
        let messages = MessageStore::new(temp.path());
        let summaries = SummaryStore::new(temp.path());
        for i in 0..10 {
            messages.add_message("user", &format!("message {i}"), None).unwrap();
        }

        let c = compressor(MockLlmClient::from_texts(&["compressed history"]), 1000);
        let id = c.compress(&messages, &summaries).await.unwrap().unwrap();
        assert_eq!(id, 1);

        // Window: 1 synthetic + 5 kept
        let window = messages.read_current().unwrap();
        assert_eq!(window.len(), 6);
        assert_eq!(window[0].content, "compressed history");
        assert_eq!(window[1].content, "message 5");

        // Band covers the prefix
        let record = summaries.latest().unwrap().unwrap();
        assert_eq!(record.start_seq, 1);
        assert_eq!(record.end_seq, 5);

        // Audit log stayed linear: 10 originals + 1 summary
        assert_eq!(messages.count_messages().unwrap(), 11);
    }

    #[tokio::test]
    async fn test_compress_small_window_is_noop() {
        let temp = TempDir::new().unwrap();
        let messages = MessageStore::new(temp.path());
        let summaries = SummaryStore::new(temp.path());
        for i in 0..5 {
            messages.add_message("user", &format!("m{i}"), None).unwrap();
        }

        let c = compressor(MockLlmClient::from_texts(&[]), 1000);
        assert!(c.compress(&messages, &summaries).await.unwrap().is_none());
        assert_eq!(summaries.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_llm_failure_writes_diagnostic_summary() {
        let temp = TempDir::new().unwrap();
        let messages = MessageStore::new(temp.path());
        let summaries = SummaryStore::new(temp.path());
        for i in 0..8 {
            messages.add_message("user", &format!("m{i}"), None).unwrap();
        }

        // Mock with no scripted responses errors on every call
        let c = compressor(MockLlmClient::from_texts(&[]), 1000);
        let id = c.compress(&messages, &summaries).await.unwrap();
        assert!(id.is_some());

        let record = summaries.latest().unwrap().unwrap();
        assert!(record.summary.starts_with("[summary failure:"));
    }

    #[tokio::test]
    async fn test_second_band_continues_from_first() {
        let temp = TempDir::new().unwrap();
        let messages = MessageStore::new(temp.path());
        let summaries = SummaryStore::new(temp.path());
        for i in 0..10 {
            messages.add_message("user", &format!("m{i}"), None).unwrap();
        }

        let c = compressor(MockLlmClient::from_texts(&["first", "second"]), 1000);
        c.compress(&messages, &summaries).await.unwrap().unwrap();

        // More traffic, then compress again
        for i in 10..16 {
            messages.add_message("user", &format!("m{i}"), None).unwrap();
        }
        c.compress(&messages, &summaries).await.unwrap().unwrap();

        let all = summaries.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].start_seq, all[0].end_seq + 1);
        assert!(all[1].end_seq >= all[1].start_seq);
    }

    #[tokio::test]
    async fn test_final_summary_leaves_window_untouched() {
        let temp = TempDir::new().unwrap();
        let messages = MessageStore::new(temp.path());
        let summaries = SummaryStore::new(temp.path());
        for i in 0..4 {
            messages.add_message("user", &format!("m{i}"), None).unwrap();
        }

        let c = compressor(MockLlmClient::from_texts(&["the final word"]), 1000);
        c.final_summary(&messages, &summaries).await.unwrap().unwrap();

        assert_eq!(messages.read_current().unwrap().len(), 4);
        assert_eq!(messages.count_messages().unwrap(), 4);
        let record = summaries.latest().unwrap().unwrap();
        assert_eq!(record.summary, "the final word");
        assert_eq!(record.end_seq, 4);
    }

    #[tokio::test]
    async fn test_final_summary_empty_run_is_noop() {
        let temp = TempDir::new().unwrap();
        let messages = MessageStore::new(temp.path());
        let summaries = SummaryStore::new(temp.path());

        let c = compressor(MockLlmClient::from_texts(&[]), 1000);
        assert!(c.final_summary(&messages, &summaries).await.unwrap().is_none());
    }
}
