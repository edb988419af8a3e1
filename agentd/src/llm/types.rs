//! Chat request/response types shared across providers.

use ctxstore::CurrentMessage;
use serde::{Deserialize, Serialize};

/// One chat-completion message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_name: Some(tool_name.into()),
        }
    }
}

impl From<CurrentMessage> for ChatMessage {
    fn from(message: CurrentMessage) -> Self {
        Self {
            role: message.role,
            content: message.content,
            tool_name: message.tool_name,
        }
    }
}

/// A function/tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A parsed completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub function_calls: Vec<FunctionCall>,
    /// Internal estimate of the reply's tokens; the canonical ledger value
    pub tokens_estimated: u64,
}
