//! AI Model Processor
//!
//! Sends the node's prompt, followed by the text of every upstream output,
//! to a completion provider and reports the generated text with token usage
//! and cost.
//!
//! # Node data
//! - `provider` (required) - provider id in the [`ProviderRegistry`]
//! - `prompt` (required) - instruction placed before the input context
//! - `apiKey` (required unless the environment holds a key for `provider`)
//! - `model`, `temperature` (default 0.7), `maxTokens` (default 1000)
//!
//! Missing configuration is an [`NodeEngineError::InvalidConfig`] error, which
//! retry middleware does not retry. Provider failures are reported as failed
//! results so they can be retried.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use inference::{
    CompletionOptions, CompletionResponse, PricingTable, ProviderConfig, ProviderError,
    ProviderRegistry,
};
use node_engine::{
    NodeEngineError, NodeProcessor, ProcessingContext, ProcessingResult, Result, ResultMetadata,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::values::{is_truthy, to_text};

const MISSING_CONFIG: &str = "Missing required AI configuration: provider, apiKey, or prompt";

/// AI node configuration read from `nodeData`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiModelConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub prompt: Option<String>,
    pub api_key: Option<String>,
}

impl AiModelConfig {
    pub fn from_node_data(node_data: &Value) -> Result<Self> {
        if node_data.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(node_data.clone())
            .map_err(|e| NodeEngineError::InvalidConfig(format!("AI node data: {}", e)))
    }

    /// Completion options with defaults applied
    pub fn options(&self) -> CompletionOptions {
        let mut options = CompletionOptions::new(self.model.clone().unwrap_or_default());
        if let Some(temperature) = self.temperature {
            options = options.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens.filter(|n| *n > 0) {
            options = options.with_max_tokens(max_tokens);
        }
        options
    }
}

/// Final prompt: the configured prompt, then each input under "Input Context"
pub fn build_prompt<'a>(prompt: &str, inputs: impl Iterator<Item = &'a Value>) -> String {
    let texts: Vec<String> = inputs
        .filter(|value| is_truthy(value))
        .map(|value| match value.get("text").filter(|t| is_truthy(t)) {
            Some(text) => to_text(text),
            None => to_text(value),
        })
        .collect();

    if texts.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\nInput Context:\n{}", prompt, texts.join("\n\n"))
    }
}

/// Resident memory of this process in bytes
fn resident_memory() -> Option<u64> {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|process| process.memory())
}

/// Processor for `aiModel` nodes
pub struct AiModelProcessor {
    providers: Arc<ProviderRegistry>,
    pricing: PricingTable,
    sample_memory: bool,
}

impl AiModelProcessor {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            providers,
            pricing: PricingTable::default(),
            sample_memory: true,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Enable or disable the resident memory sample attached to results
    pub fn with_memory_sampling(mut self, enabled: bool) -> Self {
        self.sample_memory = enabled;
        self
    }

    async fn memory_usage(&self) -> Option<u64> {
        if !self.sample_memory {
            return None;
        }
        tokio::task::spawn_blocking(resident_memory)
            .await
            .ok()
            .flatten()
    }

    fn success_result(
        &self,
        ctx: &ProcessingContext,
        provider: &str,
        options: &CompletionOptions,
        response: CompletionResponse,
    ) -> ProcessingResult {
        let usage = response.usage;
        let cost = self.pricing.cost(provider, &options.model, &usage);

        log::info!(
            "AI model node '{}' completed: {}/{} tokens={} cost=${:.6} chars={}",
            ctx.node_id,
            provider,
            options.model,
            usage.total(),
            cost,
            response.content.len()
        );

        let data = json!({
            "text": response.content,
            "metadata": {
                "provider": provider,
                "model": options.model,
                "usage": usage,
                "cost": cost,
                "finishReason": response.finish_reason,
            },
            "tokenCount": usage.total(),
            "cost": cost,
            "timestamp": Utc::now(),
            "nodeId": ctx.node_id,
        });

        ProcessingResult::success(data).with_metadata(ResultMetadata {
            tokens_used: Some(usage.total()),
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
            cost: Some(cost),
            cache_hit: false,
            ..Default::default()
        })
    }
}

#[async_trait]
impl NodeProcessor for AiModelProcessor {
    fn name(&self) -> &str {
        "ai-model"
    }

    async fn execute_core(&self, ctx: &ProcessingContext) -> Result<ProcessingResult> {
        let config = AiModelConfig::from_node_data(ctx.node_data())?;

        let provider = config.provider.as_deref().filter(|p| !p.is_empty());
        let prompt = config.prompt.as_deref().filter(|p| !p.is_empty());
        let (Some(provider), Some(prompt)) = (provider, prompt) else {
            return Err(NodeEngineError::InvalidConfig(MISSING_CONFIG.to_string()));
        };
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .or_else(|| ctx.environment.api_key(provider))
            .ok_or_else(|| NodeEngineError::InvalidConfig(MISSING_CONFIG.to_string()))?;

        let options = config.options();
        let client = self
            .providers
            .create(provider, &ProviderConfig::new(api_key, options.model.clone()))
            .map_err(|e| match &e {
                ProviderError::UnknownProvider(_) | ProviderError::Config(_) => {
                    NodeEngineError::InvalidConfig(e.to_string())
                }
                _ => NodeEngineError::ExecutionFailed(e.to_string()),
            })?;

        let final_prompt = build_prompt(prompt, ctx.inputs.upstream_values());
        log::debug!(
            "AI model node '{}' calling {} (attempt {}, {} prompt chars)",
            ctx.node_id,
            provider,
            ctx.metadata.retry_count + 1,
            final_prompt.len()
        );

        match client.generate_completion(&final_prompt, &options).await {
            Ok(response) => {
                let mut result = self.success_result(ctx, provider, &options, response);
                result.metadata.memory_usage = self.memory_usage().await;
                Ok(result)
            }
            Err(e) => {
                log::warn!("AI model node '{}' failed: {}", ctx.node_id, e);
                Ok(ProcessingResult::failure(e.to_string()).with_metadata(ResultMetadata {
                    tokens_used: Some(0),
                    cost: Some(0.0),
                    ..Default::default()
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference::{CompletionProvider, TokenUsage};
    use node_engine::{Environment, NodeInputs, ProcessorPipeline};
    use parking_lot::Mutex;

    /// Records every request and answers from a fixed script
    struct MockProvider {
        fail: bool,
        requests: Mutex<Vec<(String, CompletionOptions)>>,
    }

    impl MockProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn generate_completion(
            &self,
            prompt: &str,
            options: &CompletionOptions,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            self.requests
                .lock()
                .push((prompt.to_string(), options.clone()));
            if self.fail {
                return Err(ProviderError::RateLimited("slow down".into()));
            }
            let mut response = CompletionResponse::new("generated", TokenUsage::new(1000, 500));
            response.finish_reason = Some("stop".into());
            Ok(response)
        }
    }

    fn processor(mock: Arc<MockProvider>) -> AiModelProcessor {
        let mut registry = ProviderRegistry::new();
        registry.register_shared("openai", mock);
        AiModelProcessor::new(Arc::new(registry)).with_memory_sampling(false)
    }

    fn node_data() -> Value {
        json!({
            "provider": "openai",
            "model": "gpt-4o",
            "prompt": "Summarise",
            "apiKey": "sk-test"
        })
    }

    #[test]
    fn test_build_prompt() {
        let inputs = [
            json!({"text": "from input"}),
            json!("plain"),
            json!({"count": 2}),
            json!(null),
            json!(""),
        ];
        assert_eq!(
            build_prompt("Do it", inputs.iter()),
            "Do it\n\nInput Context:\nfrom input\n\nplain\n\n{\"count\":2}"
        );
        assert_eq!(build_prompt("Do it", std::iter::empty()), "Do it");
    }

    #[test]
    fn test_options_defaults() {
        let config = AiModelConfig::from_node_data(&json!({"model": "m"})).unwrap();
        let options = config.options();
        assert_eq!(options.model, "m");
        assert_eq!(options.temperature, 0.7);
        assert_eq!(options.max_tokens, 1000);

        let config =
            AiModelConfig::from_node_data(&json!({"temperature": 0.2, "maxTokens": 50})).unwrap();
        assert_eq!(config.options().temperature, 0.2);
        assert_eq!(config.options().max_tokens, 50);
    }

    #[tokio::test]
    async fn test_completion_with_cost() {
        let mock = MockProvider::new(false);
        let inputs = NodeInputs::new()
            .with("nodeData", node_data())
            .with("upstream", json!({"text": "context text"}));
        let ctx = ProcessingContext::new("ai", "exec", inputs);

        let result = processor(mock.clone()).execute_core(&ctx).await.unwrap();

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["text"], "generated");
        assert_eq!(data["nodeId"], "ai");
        assert_eq!(data["tokenCount"], 1500);
        assert_eq!(data["metadata"]["provider"], "openai");
        assert_eq!(data["metadata"]["usage"]["inputTokens"], 1000);
        assert_eq!(data["metadata"]["finishReason"], "stop");
        assert!((data["cost"].as_f64().unwrap() - 0.0125).abs() < 1e-12);

        assert_eq!(result.metadata.tokens_used, Some(1500));
        assert_eq!(result.metadata.input_tokens, Some(1000));
        assert_eq!(result.metadata.output_tokens, Some(500));
        assert!(!result.metadata.cache_hit);

        let requests = mock.requests.lock();
        assert_eq!(requests[0].0, "Summarise\n\nInput Context:\ncontext text");
        assert_eq!(requests[0].1, CompletionOptions::new("gpt-4o"));
    }

    #[tokio::test]
    async fn test_missing_configuration_is_config_error() {
        let mock = MockProvider::new(false);
        for data in [
            json!({"provider": "openai", "apiKey": "k"}),
            json!({"prompt": "p", "apiKey": "k"}),
            json!({"provider": "openai", "prompt": "p"}),
        ] {
            let ctx = ProcessingContext::new("ai", "exec", NodeInputs::new().with("nodeData", data));
            let err = processor(mock.clone()).execute_core(&ctx).await.unwrap_err();
            assert!(matches!(err, NodeEngineError::InvalidConfig(ref m) if m == MISSING_CONFIG));
        }
        assert!(mock.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_api_key_from_environment() {
        let mock = MockProvider::new(false);
        let inputs = NodeInputs::new().with(
            "nodeData",
            json!({"provider": "openai", "model": "gpt-4o", "prompt": "p"}),
        );
        let ctx = ProcessingContext::new("ai", "exec", inputs)
            .with_environment(Arc::new(Environment::default().with_api_key("openai", "sk-env")));

        let result = processor(mock.clone()).execute_core(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(mock.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_config_error() {
        let mock = MockProvider::new(false);
        let mut data = node_data();
        data["provider"] = json!("mistral");
        let ctx = ProcessingContext::new("ai", "exec", NodeInputs::new().with("nodeData", data));

        let err = processor(mock).execute_core(&ctx).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: Unknown provider: mistral"
        );
    }

    #[tokio::test]
    async fn test_provider_error_becomes_failed_result() {
        let mock = MockProvider::new(true);
        let ctx = ProcessingContext::new("ai", "exec", NodeInputs::new().with("nodeData", node_data()));

        let result = ProcessorPipeline::new(Arc::new(processor(mock)))
            .process(&ctx)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Rate limited: slow down"));
        assert_eq!(result.metadata.tokens_used, Some(0));
        assert_eq!(result.metadata.cost, Some(0.0));
    }

    #[test]
    fn test_resident_memory_of_this_process() {
        assert!(resident_memory().is_some_and(|bytes| bytes > 0));
    }
}
