//! Mock LLM client for unit and integration tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{ChatMessage, ChatResponse, LlmClient, LlmError};
use ctxstore::estimate_tokens;

/// Returns scripted responses in order and counts calls.
pub struct MockLlmClient {
    responses: Mutex<Vec<ChatResponse>>,
    call_count: AtomicUsize,
    /// When the script runs out, keep returning this instead of erroring
    fallback: Option<ChatResponse>,
}

impl MockLlmClient {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        debug!(response_count = responses.len(), "MockLlmClient::new: called");
        Self {
            responses: Mutex::new(responses),
            call_count: AtomicUsize::new(0),
            fallback: None,
        }
    }

    /// Script plain-text replies.
    pub fn from_texts(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|t| ChatResponse {
                    content: t.to_string(),
                    function_calls: vec![],
                    tokens_estimated: estimate_tokens(t),
                })
                .collect(),
        )
    }

    /// Use `text` for every call past the end of the script.
    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(ChatResponse {
            content: text.to_string(),
            function_calls: vec![],
            tokens_estimated: estimate_tokens(text),
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<ChatResponse, LlmError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        debug!(idx, "MockLlmClient::chat: called");

        let mut responses = self.responses.lock().expect("mock lock");
        if idx < responses.len() {
            return Ok(responses[idx].clone());
        }
        drop(responses);

        match &self.fallback {
            Some(fallback) => Ok(fallback.clone()),
            None => Err(LlmError::InvalidResponse("No more mock responses".to_string())),
        }
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }
}
