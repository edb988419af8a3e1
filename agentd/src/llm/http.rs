//! Multi-provider HTTP chat-completion adapter.
//!
//! One client covers OpenAI-compatible endpoints (OpenAI, LM Studio) and
//! Ollama. Only the endpoint path, body shape and response field names
//! differ per provider; retries, logging and token accounting are shared.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::logger::RawLlmLogger;
use super::{ChatMessage, ChatResponse, FunctionCall, LlmClient, LlmError};
use crate::config::Config;
use ctxstore::estimate_tokens;

/// Maximum number of retries for transient errors
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Supported chat-completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    LmStudio,
    Ollama,
}

impl Provider {
    pub fn parse(name: &str) -> Result<Self, LlmError> {
        match name {
            "openai" => Ok(Self::OpenAi),
            "lmstudio" => Ok(Self::LmStudio),
            "ollama" => Ok(Self::Ollama),
            other => Err(LlmError::Config(format!(
                "Unknown LLM provider: '{other}'. Supported: openai, lmstudio, ollama"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::LmStudio => "lmstudio",
            Self::Ollama => "ollama",
        }
    }

    /// Endpoint path relative to the provider base URL.
    fn endpoint_path(self) -> &'static str {
        match self {
            Self::OpenAi | Self::LmStudio => "/v1/chat/completions",
            Self::Ollama => "/api/chat",
        }
    }
}

/// HTTP chat-completion client.
pub struct HttpLlmClient {
    provider: Provider,
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: Client,
    function_schemas: Vec<Value>,
    raw_logger: Option<Arc<RawLlmLogger>>,
}

impl HttpLlmClient {
    /// Create a client from the active provider section of the config.
    pub fn from_config(
        config: &Config,
        provider: Provider,
        raw_logger: Option<Arc<RawLlmLogger>>,
    ) -> Result<Self, LlmError> {
        let section = config.active_provider();
        let timeout = Duration::from_secs(config.llm.timeout_secs);

        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            provider,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            model: section.model.clone(),
            api_key: section.api_key.clone(),
            http,
            function_schemas: Vec::new(),
            raw_logger,
        })
    }

    /// Attach the function-calling catalog advertised to the model.
    pub fn with_function_schemas(mut self, schemas: Vec<Value>) -> Self {
        self.function_schemas = schemas;
        self
    }

    /// Build the provider-specific request body.
    fn build_request_body(&self, messages: &[ChatMessage]) -> Value {
        debug!(provider = self.provider.as_str(), message_count = messages.len(), "build_request_body: called");

        let rendered: Vec<Value> = messages
            .iter()
            .map(|m| {
                let mut record = json!({"role": m.role, "content": m.content});
                if let Some(tool_name) = &m.tool_name {
                    record["name"] = json!(tool_name);
                }
                record
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": rendered,
            "stream": false,
        });

        // Ollama ignores the OpenAI function catalog; only attach it on
        // OpenAI-shaped providers.
        if self.provider != Provider::Ollama && !self.function_schemas.is_empty() {
            body["functions"] = json!(self.function_schemas);
        }

        body
    }

    /// Parse a reply through the provider-specific path.
    fn parse_response(&self, body: &Value) -> Result<ChatResponse, LlmError> {
        let message = match self.provider {
            Provider::OpenAi | Provider::LmStudio => body
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message".to_string()))?,
            Provider::Ollama => body
                .get("message")
                .ok_or_else(|| LlmError::InvalidResponse("missing message".to_string()))?,
        };

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut function_calls = Vec::new();
        if let Some(call) = message.get("function_call")
            && let Some(parsed) = parse_function_call(call)
        {
            function_calls.push(parsed);
        }
        if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
            for tool_call in tool_calls {
                let call = tool_call.get("function").unwrap_or(tool_call);
                if let Some(parsed) = parse_function_call(call) {
                    function_calls.push(parsed);
                }
            }
        }

        let tokens_estimated = estimate_tokens(&content);

        Ok(ChatResponse {
            content,
            function_calls,
            tokens_estimated,
        })
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<(u16, Value), LlmError> {
        let mut request = self.http.post(url).header("content-type", "application/json").json(body);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request.send().await.map_err(LlmError::Network)?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(LlmError::Api { status, message: text });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse(format!("non-JSON reply: {e}")))?;
        Ok((status, parsed))
    }
}

/// Decode one function call from either the string-arguments form or the
/// inline-object form.
fn parse_function_call(call: &Value) -> Option<FunctionCall> {
    let name = call.get("name").and_then(Value::as_str)?.to_string();
    let arguments = match call.get("arguments") {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(json!({})),
        Some(other) => other.clone(),
        None => json!({}),
    };
    Some(FunctionCall { name, arguments })
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse, LlmError> {
        debug!(provider = self.provider.as_str(), model = %self.model, "chat: called");
        let url = format!("{}{}", self.base_url, self.provider.endpoint_path());
        let body = self.build_request_body(messages);

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                warn!(attempt, backoff_ms = backoff, "chat: retrying after transient error");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            match self.post_once(&url, &body).await {
                Ok((_, reply)) => {
                    if let Some(logger) = &self.raw_logger {
                        logger.log(self.provider.as_str(), &body, &reply);
                    }
                    return self.parse_response(&reply);
                }
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    debug!(attempt, error = %e, "chat: transient error");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::InvalidResponse("Max retries exceeded".to_string())))
    }

    fn provider_name(&self) -> &str {
        self.provider.as_str()
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(provider: Provider) -> HttpLlmClient {
        HttpLlmClient {
            provider,
            base_url: "http://localhost:9999".to_string(),
            model: "test-model".to_string(),
            api_key: None,
            http: Client::new(),
            function_schemas: Vec::new(),
            raw_logger: None,
        }
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(Provider::parse("openai").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::parse("ollama").unwrap(), Provider::Ollama);
        assert!(Provider::parse("anthropic").is_err());
    }

    #[test]
    fn test_build_request_body_openai_shape() {
        let c = client(Provider::OpenAi).with_function_schemas(vec![json!({"name": "github_get_issue"})]);
        let body = c.build_request_body(&[ChatMessage::system("sys"), ChatMessage::user("hello")]);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert!(body["functions"].is_array());
    }

    #[test]
    fn test_build_request_body_ollama_omits_functions() {
        let c = client(Provider::Ollama).with_function_schemas(vec![json!({"name": "tool"})]);
        let body = c.build_request_body(&[ChatMessage::user("hi")]);
        assert!(body.get("functions").is_none());
    }

    #[test]
    fn test_tool_message_carries_name() {
        let c = client(Provider::OpenAi);
        let body = c.build_request_body(&[ChatMessage::tool("result", "executor_execute")]);
        assert_eq!(body["messages"][0]["name"], "executor_execute");
    }

    #[test]
    fn test_parse_openai_response() {
        let c = client(Provider::OpenAi);
        let reply = json!({
            "choices": [{"message": {"role": "assistant", "content": "done",
                "function_call": {"name": "github_get_issue", "arguments": "{\"number\": 42}"}}}]
        });
        let parsed = c.parse_response(&reply).unwrap();
        assert_eq!(parsed.content, "done");
        assert_eq!(parsed.function_calls.len(), 1);
        assert_eq!(parsed.function_calls[0].name, "github_get_issue");
        assert_eq!(parsed.function_calls[0].arguments["number"], 42);
    }

    #[test]
    fn test_parse_ollama_response() {
        let c = client(Provider::Ollama);
        let reply = json!({"message": {"role": "assistant", "content": "回答"}});
        let parsed = c.parse_response(&reply).unwrap();
        assert_eq!(parsed.content, "回答");
        assert_eq!(parsed.tokens_estimated, 2);
    }

    #[test]
    fn test_parse_tool_calls_list() {
        let c = client(Provider::OpenAi);
        let reply = json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"function": {"name": "a", "arguments": "{}"}},
                {"function": {"name": "b", "arguments": {"x": 1}}}
            ]}}]
        });
        let parsed = c.parse_response(&reply).unwrap();
        assert_eq!(parsed.function_calls.len(), 2);
        assert_eq!(parsed.function_calls[1].arguments["x"], 1);
    }

    #[test]
    fn test_parse_missing_message_is_error() {
        let c = client(Provider::OpenAi);
        assert!(c.parse_response(&json!({"choices": []})).is_err());
    }
}
