//! Direct Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;

use crate::error::LlmError;
use crate::llm::{LlmClient, ToolCall, ToolCompletionRequest, ToolCompletionResponse};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Per-round request timeout. Bounds each tool-loop round even though the
/// loop itself has no wall-clock limit.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<Value>,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

pub struct AnthropicClient {
    api_key: SecretString,
    model: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn request_failed(&self, reason: impl std::fmt::Display) -> LlmError {
        LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let (system, messages) = convert_messages(&request.messages);
        let tools: Vec<ApiTool> = request
            .tools
            .iter()
            .map(|t| ApiTool {
                name: &t.name,
                description: &t.description,
                input_schema: &t.parameters,
            })
            .collect();

        let body = ApiRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system,
            messages,
            tools,
        };

        let resp = self
            .client
            .post(API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(self.request_failed(format!("HTTP {status}: {text}")));
        }

        let value: Value = resp.json().await.map_err(|e| self.request_failed(e))?;
        parse_response(&value)
    }
}

/// Map the neutral conversation shape onto Anthropic's wire format:
/// system turns join into the top-level `system` field, assistant tool
/// calls become `tool_use` blocks, and consecutive tool-result turns are
/// grouped into a single user message of `tool_result` blocks.
fn convert_messages(messages: &[crate::llm::ChatMessage]) -> (Option<String>, Vec<ApiMessage>) {
    let mut system_parts = Vec::new();
    let mut api_messages: Vec<ApiMessage> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => {
                if let Some(ref text) = msg.content {
                    system_parts.push(text.clone());
                }
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(ref text) = msg.content
                    && !text.is_empty()
                {
                    blocks.push(serde_json::json!({"type": "text", "text": text}));
                }
                for call in &msg.tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                api_messages.push(ApiMessage {
                    role: "assistant",
                    content: blocks,
                });
            }
            "tool" => {
                let block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content.clone().unwrap_or_default(),
                });
                // Tool results for one assistant turn share a user message.
                match api_messages.last_mut() {
                    Some(last) if last.role == "user" && is_tool_result_message(last) => {
                        last.content.push(block);
                    }
                    _ => api_messages.push(ApiMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
            _ => {
                api_messages.push(ApiMessage {
                    role: "user",
                    content: vec![serde_json::json!({
                        "type": "text",
                        "text": msg.content.clone().unwrap_or_default(),
                    })],
                });
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, api_messages)
}

fn is_tool_result_message(msg: &ApiMessage) -> bool {
    msg.content
        .first()
        .and_then(|b| b["type"].as_str())
        .is_some_and(|t| t == "tool_result")
}

/// Walk the response content blocks, collecting text, tool calls, and any
/// citation URIs. Unknown block types are skipped rather than rejected.
fn parse_response(value: &Value) -> Result<ToolCompletionResponse, LlmError> {
    let blocks = value["content"]
        .as_array()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: "anthropic".to_string(),
            reason: "response has no content array".to_string(),
        })?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut citations = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    text.push_str(t);
                }
                for citation in block["citations"].as_array().into_iter().flatten() {
                    if let Some(url) = citation["url"].as_str() {
                        citations.push(url.to_string());
                    }
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    Ok(ToolCompletionResponse {
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls,
        citations,
        input_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    })
}
