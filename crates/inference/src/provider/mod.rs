//! Completion provider abstraction
//!
//! Every language-model vendor is reached through [`CompletionProvider`].
//! Concrete HTTP clients live outside this workspace; they only need to turn
//! a prompt plus [`CompletionOptions`] into a [`CompletionResponse`].

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use registry::{FnProviderFactory, ProviderFactory, ProviderRegistry};

/// Error types for provider operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Options for a single completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    /// Model name as the vendor knows it (e.g. "gpt-4o")
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Upper bound on generated tokens
    pub max_tokens: u32,
}

impl CompletionOptions {
    /// Default sampling temperature when a node does not set one
    pub const DEFAULT_TEMPERATURE: f64 = 0.7;
    /// Default generation budget when a node does not set one
    pub const DEFAULT_MAX_TOKENS: u32 = 1000;

    /// Options for `model` with default temperature and token budget
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: Self::DEFAULT_TEMPERATURE,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token accounting reported by a provider
///
/// Vendors disagree on naming (`inputTokens` vs `promptTokens`,
/// `outputTokens` vs `completionTokens`); both spellings deserialize here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default, alias = "promptTokens", alias = "prompt_tokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "completionTokens", alias = "completion_tokens")]
    pub output_tokens: u64,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build usage from input/output counts, deriving the total
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Total tokens, falling back to input + output when the vendor omitted it
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input_tokens + self.output_tokens
        }
    }
}

/// Result of a completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    /// Generated text
    pub content: String,
    /// Token accounting for this request
    pub usage: TokenUsage,
    /// Vendor-specific stop reason, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    pub fn new(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            usage,
            finish_reason: None,
        }
    }
}

/// Credentials and model selection used to build a provider client
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: Option<String>,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: Some(model.into()),
        }
    }
}

/// The contract every language-model vendor client implements.
///
/// Implementations must be cheap to share behind an `Arc`; the workflow
/// engine may call `generate_completion` from several nodes at once.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider identifier (e.g. "openai")
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`
    async fn generate_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, ProviderError>;
}
