//! LlmClient trait definition.

use async_trait::async_trait;

use super::{ChatMessage, ChatResponse, LlmError};

/// Stateless chat-completion client.
///
/// Conversation state lives in the message store, not in the client; each
/// call sends the full current window and returns one reply.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the current context window and await the reply.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse, LlmError>;

    /// Provider name recorded into run metadata.
    fn provider_name(&self) -> &str;

    /// Model identifier recorded into run metadata.
    fn model(&self) -> &str;
}
