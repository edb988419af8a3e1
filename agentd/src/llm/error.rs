//! LLM error types.

use std::time::Duration;

/// Errors surfaced by LLM clients.
///
/// Request failures bubble out of the adapter; the coordinator classifies
/// them and either retries (transient) or fails the task (fatal).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Transient errors are worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            LlmError::Api {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !LlmError::Api {
                status: 401,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!LlmError::InvalidResponse("bad".into()).is_transient());
        assert!(
            LlmError::RateLimited {
                retry_after: Duration::from_secs(60)
            }
            .is_transient()
        );
    }
}
