//! Built-in tools.

pub mod fetch;
pub mod shell;

pub use fetch::FetchTool;
pub use shell::ShellTool;
