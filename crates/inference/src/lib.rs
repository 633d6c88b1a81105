//! Provider-agnostic completion library
//!
//! Workflow nodes talk to language-model vendors through one narrow contract:
//! "generate a completion for this prompt with this model, temperature and
//! token budget, and tell me how many tokens it cost". This crate holds:
//!
//! - **[`CompletionProvider`]**: the async contract every vendor client implements
//! - **[`ProviderRegistry`]**: provider id (`openai`, `anthropic`, ...) to client factory
//! - **[`PricingTable`]**: static per-provider, per-model prices used to compute cost
//!
//! # Example
//!
//! ```rust,ignore
//! use inference::{CompletionOptions, PricingTable, ProviderConfig, ProviderRegistry};
//!
//! let mut registry = ProviderRegistry::new();
//! registry.register("openai", Box::new(MyOpenAiFactory));
//!
//! let provider = registry.create("openai", &ProviderConfig::new("sk-...", "gpt-4o"))?;
//! let response = provider
//!     .generate_completion("Summarise this", &CompletionOptions::new("gpt-4o"))
//!     .await?;
//!
//! let cost = PricingTable::default().cost("openai", "gpt-4o", &response.usage);
//! ```

pub mod pricing;
pub mod provider;

pub use pricing::{ModelPricing, PricingTable};
pub use provider::{
    CompletionOptions, CompletionProvider, CompletionResponse, FnProviderFactory, ProviderConfig,
    ProviderError, ProviderFactory, ProviderRegistry, TokenUsage,
};
