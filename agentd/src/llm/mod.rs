//! LLM client module.
//!
//! One HTTP adapter covers every supported provider; the request body and
//! response field names are the only things that differ between them. All
//! token accounting uses the internal estimator, never provider-reported
//! usage.

use std::sync::Arc;

use tracing::debug;

pub mod client;
mod error;
mod http;
pub mod logger;
pub mod mock;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use http::{HttpLlmClient, Provider};
pub use logger::RawLlmLogger;
pub use types::{ChatMessage, ChatResponse, FunctionCall};

use crate::config::Config;

/// Create an LLM client for the provider named in config.
pub fn create_client(config: &Config, raw_logger: Option<Arc<RawLlmLogger>>) -> Result<Arc<dyn LlmClient>, LlmError> {
    let provider = Provider::parse(&config.llm.provider)?;
    debug!(provider = provider.as_str(), model = %config.active_provider().model, "create_client: called");
    Ok(Arc::new(HttpLlmClient::from_config(config, provider, raw_logger)?))
}
