//! Output nodes
//!
//! Nodes that present the results of a workflow.

mod text_output;

pub use text_output::{OutputFormat, TextOutputProcessor};
