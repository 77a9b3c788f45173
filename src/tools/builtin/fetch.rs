//! HTTP fetch tool.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ToolError;
use crate::tools::tool::{Tool, require_str};

/// Maximum body size returned to the model.
const MAX_BODY: usize = 64 * 1024;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FetchTool {
    client: reqwest::Client,
}

impl FetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for FetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return the response body (truncated)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _workdir: &Path,
    ) -> Result<String, ToolError> {
        let url = require_str(&params, "fetch", "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidParameters {
                name: "fetch".to_string(),
                reason: format!("not an http(s) URL: {url}"),
            });
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "fetch".to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| ToolError::ExecutionFailed {
            name: "fetch".to_string(),
            reason: e.to_string(),
        })?;

        let mut end = body.len().min(MAX_BODY);
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }

        let result = serde_json::json!({
            "status": status,
            "body": &body[..end],
        });
        Ok(result.to_string())
    }
}
