use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Text generation capability of an LLM vendor.
///
/// Implementations live outside this crate (vendor SDKs, HTTP clients, test fakes).
#[async_trait]
pub trait LlmProvider: Send + Sync + 'static {
    /// Vendor name used in logs (e.g. `openai`).
    fn name(&self) -> &str;

    /// Model identifier used in logs.
    fn model(&self) -> &str;

    /// Generate a completion for `prompt`, giving up after `timeout`.
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, ProviderError>;
}

/// Error raised by a provider call.
///
/// `code` is an optional machine-readable tag. Only [`ProviderError::INSUFFICIENT_QUOTA`]
/// changes control flow: it aborts the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub code: Option<String>,
}

impl ProviderError {
    pub const INSUFFICIENT_QUOTA: &'static str = "insufficient_quota";
    pub const TIMEOUT: &'static str = "timeout";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        Self::with_code(message, Self::INSUFFICIENT_QUOTA)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::with_code(
            format!("generate timed out after {}s", after.as_secs_f64()),
            Self::TIMEOUT,
        )
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.code.as_deref() == Some(Self::INSUFFICIENT_QUOTA)
    }

    /// Rendering stored in the attempt history: `provider_error:<code>:<message>`.
    pub fn audit_string(&self) -> String {
        match &self.code {
            Some(code) => format!("provider_error:{code}:{}", self.message),
            None => format!("provider_error:{}", self.message),
        }
    }
}
