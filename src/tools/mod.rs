//! Tools callable from the tool-loop provider.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::ToolRegistry;
pub use tool::Tool;
