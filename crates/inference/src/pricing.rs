//! Static token pricing
//!
//! Prices are quoted per 1,000 tokens, separately for input and output.
//! A model the table does not know is billed at the provider's first listed
//! model; a provider the table does not know costs nothing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::provider::TokenUsage;

/// Price of one model, per 1,000 tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    pub model: String,
    #[serde(rename = "inputPricePer1K")]
    pub input_price_per_1k: f64,
    #[serde(rename = "outputPricePer1K")]
    pub output_price_per_1k: f64,
}

impl ModelPricing {
    pub fn new(model: impl Into<String>, input_price_per_1k: f64, output_price_per_1k: f64) -> Self {
        Self {
            model: model.into(),
            input_price_per_1k,
            output_price_per_1k,
        }
    }

    /// Monetary cost of `usage` at this price
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1000.0) * self.input_price_per_1k
            + (usage.output_tokens as f64 / 1000.0) * self.output_price_per_1k
    }
}

/// Per-provider price lists
///
/// Model order within a provider matters: the first entry is the fallback
/// for unknown models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    providers: HashMap<String, Vec<ModelPricing>>,
}

impl PricingTable {
    /// An empty table (every request costs 0)
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Parse a table from JSON of the form
    /// `{"openai": [{"model": "...", "inputPricePer1K": 0.005, "outputPricePer1K": 0.015}]}`
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Append a model price to a provider's list
    pub fn insert(&mut self, provider: &str, pricing: ModelPricing) {
        let models = self.providers.entry(provider.to_string()).or_default();
        match models.iter_mut().find(|m| m.model == pricing.model) {
            Some(existing) => *existing = pricing,
            None => models.push(pricing),
        }
    }

    /// Look up the price for `model`, falling back to the provider's first model
    pub fn lookup(&self, provider: &str, model: &str) -> Option<&ModelPricing> {
        let models = self.providers.get(provider)?;
        models
            .iter()
            .find(|m| m.model == model)
            .or_else(|| models.first())
    }

    /// Cost of `usage` on `provider`/`model`; 0 for unknown providers
    pub fn cost(&self, provider: &str, model: &str, usage: &TokenUsage) -> f64 {
        match self.lookup(provider, model) {
            Some(pricing) => pricing.cost(usage),
            None => {
                log::debug!("No pricing for provider '{}', cost is 0", provider);
                0.0
            }
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut table = Self::empty();

        table.insert("openai", ModelPricing::new("gpt-4o-mini", 0.00015, 0.0006));
        table.insert("openai", ModelPricing::new("gpt-4o", 0.005, 0.015));
        table.insert("openai", ModelPricing::new("gpt-4.5-preview", 0.01, 0.03));

        table.insert(
            "anthropic",
            ModelPricing::new("claude-3-haiku-20240307", 0.00025, 0.00125),
        );
        table.insert(
            "anthropic",
            ModelPricing::new("claude-3-sonnet-20240229", 0.003, 0.015),
        );
        table.insert(
            "anthropic",
            ModelPricing::new("claude-3-opus-20240229", 0.015, 0.075),
        );

        table
    }
}
