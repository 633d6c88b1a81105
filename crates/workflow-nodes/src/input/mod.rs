//! Input nodes
//!
//! Nodes that introduce author-supplied data into a workflow.

mod text_input;

pub use text_input::TextInputProcessor;
