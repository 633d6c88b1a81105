//! Workflow Nodes
//!
//! Node processor implementations for the workflow engine. Each processor
//! implements [`node_engine::NodeProcessor`] for one node type and is
//! registered, wrapped in its default middleware, by [`build_registry`].
//!
//! # Categories
//!
//! - **Input**: author-supplied text entering the workflow
//! - **Processing**: AI model completions and data shaping (transform,
//!   filter, branch, aggregate, validate)
//! - **Output**: final results collected from upstream nodes

pub mod input;
pub mod output;
pub mod processing;
pub mod setup;
mod values;

// Re-export all processors for convenience
pub use input::*;
pub use output::*;
pub use processing::*;
pub use setup::{build_registry, register_defaults};
