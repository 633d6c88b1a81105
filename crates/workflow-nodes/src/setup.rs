//! Default processor registry
//!
//! Hosts call [`build_registry`] at startup to get a [`ProcessorRegistry`]
//! covering every built-in node type with the default middleware:
//!
//! | node type                          | processor                 | middleware (outer first) |
//! |------------------------------------|---------------------------|--------------------------|
//! | `input`                            | [`TextInputProcessor`]    | none                     |
//! | `aiModel`                          | [`AiModelProcessor`]      | retry, caching           |
//! | `processing`, `advancedProcessing` | [`DataProcessingProcessor`] | caching                |
//! | `output`                           | [`TextOutputProcessor`]   | none                     |
//!
//! One cache is shared by every node type of the registry.
//!
//! # Example
//!
//! ```ignore
//! let providers = Arc::new(my_provider_registry());
//! let registry = workflow_nodes::build_registry(&config, providers);
//! let engine = node_engine::DagEngine::new(Arc::new(registry), config)?;
//! ```

use std::sync::Arc;

use inference::ProviderRegistry;
use node_engine::{
    CachingMiddleware, EngineConfig, NodeKind, ProcessorPipeline, ProcessorRegistry,
    RetryMiddleware,
};

use crate::input::TextInputProcessor;
use crate::output::TextOutputProcessor;
use crate::processing::{AiModelProcessor, DataProcessingProcessor};

/// Registry with every built-in node type and a fresh shared cache
pub fn build_registry(config: &EngineConfig, providers: Arc<ProviderRegistry>) -> ProcessorRegistry {
    let cache = Arc::new(CachingMiddleware::from_config(&config.cache));
    let mut registry = ProcessorRegistry::new();
    register_defaults(&mut registry, config, AiModelProcessor::new(providers), cache);
    registry
}

/// Register the built-in node types into `registry`
///
/// The caller keeps `cache` to purge or clear it while the registry is live.
pub fn register_defaults(
    registry: &mut ProcessorRegistry,
    config: &EngineConfig,
    ai_model: AiModelProcessor,
    cache: Arc<CachingMiddleware>,
) {
    registry.register(
        NodeKind::Input,
        ProcessorPipeline::new(Arc::new(TextInputProcessor::new())),
    );

    registry.register(
        NodeKind::AiModel,
        ProcessorPipeline::new(Arc::new(ai_model))
            .with_middleware(Arc::new(RetryMiddleware::new(config.retry.clone())))
            .with_middleware(cache.clone()),
    );

    let data_processing = Arc::new(DataProcessingProcessor::new());
    for kind in [NodeKind::Processing, NodeKind::AdvancedProcessing] {
        registry.register(
            kind,
            ProcessorPipeline::new(data_processing.clone()).with_middleware(cache.clone()),
        );
    }

    registry.register(
        NodeKind::Output,
        ProcessorPipeline::new(Arc::new(TextOutputProcessor::new())),
    );

    log::info!("Registered {} built-in node types", NodeKind::ALL.len());
}
