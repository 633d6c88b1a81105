//! Processor registry
//!
//! Maps each [`NodeKind`] to the [`ProcessorPipeline`] that executes it.
//! Dispatch is a plain map lookup on the parsed type tag.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{NodeEngineError, Result};
use crate::processor::ProcessorPipeline;
use crate::types::NodeKind;

#[derive(Default)]
pub struct ProcessorRegistry {
    pipelines: HashMap<NodeKind, Arc<ProcessorPipeline>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the pipeline for a node kind, replacing any previous one
    pub fn register(&mut self, kind: NodeKind, pipeline: ProcessorPipeline) {
        log::debug!(
            "Registered processor '{}' for '{}' with middleware {:?}",
            pipeline.processor_name(),
            kind,
            pipeline.middleware_names()
        );
        self.pipelines.insert(kind, Arc::new(pipeline));
    }

    /// Pipeline for a node type tag
    pub fn get(&self, node_type: &str) -> Result<Arc<ProcessorPipeline>> {
        NodeKind::parse(node_type)
            .and_then(|kind| self.pipelines.get(&kind))
            .cloned()
            .ok_or_else(|| NodeEngineError::UnknownNodeType(node_type.to_string()))
    }

    /// Check if a node type tag has a registered processor
    pub fn has_node_type(&self, node_type: &str) -> bool {
        NodeKind::parse(node_type).is_some_and(|kind| self.pipelines.contains_key(&kind))
    }

    /// Registered node kinds
    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<NodeKind> = self.pipelines.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{NodeProcessor, ProcessingContext, ProcessingResult};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl NodeProcessor for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute_core(&self, _ctx: &ProcessingContext) -> Result<ProcessingResult> {
            Ok(ProcessingResult::success(serde_json::Value::Null))
        }
    }

    #[test]
    fn test_lookup_by_tag() {
        let mut registry = ProcessorRegistry::new();
        registry.register(NodeKind::Processing, ProcessorPipeline::new(Arc::new(Noop)));

        assert!(registry.has_node_type("processing"));
        assert!(!registry.has_node_type("advancedProcessing"));
        assert!(!registry.has_node_type("bogus"));
        assert_eq!(registry.get("processing").unwrap().processor_name(), "noop");
        assert!(matches!(
            registry.get("aiModel"),
            Err(NodeEngineError::UnknownNodeType(t)) if t == "aiModel"
        ));
        assert_eq!(registry.kinds(), vec![NodeKind::Processing]);
    }
}
