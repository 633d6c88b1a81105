//! Processing nodes
//!
//! Nodes that generate or reshape data.

mod ai_model;
mod data_processing;

pub use ai_model::{build_prompt, AiModelConfig, AiModelProcessor};
pub use data_processing::{CoinFlip, DataProcessingProcessor, ProcessingConfig};
