//! Tool trait.

use std::path::Path;

use async_trait::async_trait;

use crate::error::ToolError;

/// A capability the model can invoke during a tool loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool. `workdir` is the executing job's working directory.
    async fn execute(
        &self,
        params: serde_json::Value,
        workdir: &Path,
    ) -> Result<String, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    params: &'a serde_json::Value,
    tool: &str,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required string parameter {key:?}"),
        })
}
