//! Provider trait and common types for structured LLM completions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type for provider operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Response parse error: {0}")]
    ParseError(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Provider not available: {0}")]
    NotAvailable(String),
}

impl ProviderError {
    /// Transport failures, throttling and server errors are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::ApiError { status, .. } => *status >= 500 || *status == 408,
            ProviderError::RequestFailed(_)
            | ProviderError::ParseError(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::NotAvailable(_) => true,
            ProviderError::AuthError(_) => false,
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// A completion request whose answer must conform to `schema`
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    /// Name of the expected response type
    pub schema_name: String,
    /// JSON schema of the expected response
    pub schema: serde_json::Value,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Raw provider answer, before validation
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Trait that all completion providers must implement
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Get the provider name for logging/display
    fn name(&self) -> &'static str;

    /// Check if this provider is properly configured and ready
    fn is_configured(&self) -> bool;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}
