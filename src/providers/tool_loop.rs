//! Tool-loop provider — drives a remote model through a bounded
//! request/response loop, executing requested tool calls against the local
//! registry and feeding results back.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ToolLoopConfig;
use crate::engine::job::{ExitInfo, Job};
use crate::error::ProviderError;
use crate::llm::{ChatMessage, LlmClient, ToolCompletionRequest};
use crate::providers::{ExecutionContext, ExecutionResult, Provider};
use crate::tools::ToolRegistry;

const SYSTEM_PROMPT: &str = "You are an autonomous assistant completing one task \
inside a repository working directory. Use the available tools when you need to \
inspect files, run commands, or fetch resources. When the task is done, reply \
with a concise final answer and stop calling tools.";

pub struct ToolLoopProvider {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    config: ToolLoopConfig,
    /// Jobs flagged for cooperative cancellation, checked between rounds and
    /// between tool calls.
    aborted: Mutex<HashSet<String>>,
    /// Jobs currently inside `execute`.
    active: Mutex<HashSet<String>>,
}

impl ToolLoopProvider {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>, config: ToolLoopConfig) -> Self {
        Self {
            llm,
            tools,
            config,
            aborted: Mutex::new(HashSet::new()),
            active: Mutex::new(HashSet::new()),
        }
    }

    fn is_aborted(&self, job_id: &str) -> bool {
        self.aborted
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    fn enter(&self, job_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(job_id.to_string());
        }
    }

    fn leave(&self, job_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(job_id);
        }
        if let Ok(mut aborted) = self.aborted.lock() {
            aborted.remove(job_id);
        }
    }

    fn result(&self, ctx: &ExecutionContext, exit: ExitInfo) -> ExecutionResult {
        ExecutionResult {
            output_tail: ctx.sink.tail(),
            exit,
            model: Some(self.llm.model_name().to_string()),
            provider: self.name().to_string(),
        }
    }

    async fn aborted_result(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, ProviderError> {
        ctx.sink.append("\n[canceled] tool loop aborted\n").await?;
        Ok(self.result(ctx, ExitInfo::with_signal(130, "aborted")))
    }
}

#[async_trait]
impl Provider for ToolLoopProvider {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, ProviderError> {
        self.enter(&job.id);
        let result = self.run_loop(job, ctx).await;
        self.leave(&job.id);
        result
    }

    async fn abort(&self, job_id: &str) -> bool {
        let live = self
            .active
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false);
        if let Ok(mut aborted) = self.aborted.lock() {
            aborted.insert(job_id.to_string());
        }
        live
    }
}

impl ToolLoopProvider {
    async fn run_loop(
        &self,
        job: &Job,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, ProviderError> {
        // No OS process exists for this backend; the session id is the
        // abortable handle.
        (ctx.register_handle)(format!("llm-session-{}", Uuid::new_v4().simple()));

        let mut messages = vec![
            ChatMessage::system(format!(
                "{SYSTEM_PROMPT}\n\nWorking directory: {}",
                ctx.workdir.display()
            )),
            ChatMessage::user(job.prompt.clone()),
        ];
        let mut citations: Vec<String> = Vec::new();
        let tool_defs = self.tools.definitions().await;

        for round in 1..=self.config.max_rounds {
            if self.is_aborted(&job.id) {
                return self.aborted_result(ctx).await;
            }

            let request = ToolCompletionRequest::new(messages.clone(), tool_defs.clone());
            let response =
                self.llm
                    .complete_with_tools(request)
                    .await
                    .map_err(|e| ProviderError::Execution {
                        reason: e.to_string(),
                    })?;

            for uri in &response.citations {
                if !citations.contains(uri) {
                    citations.push(uri.clone());
                }
            }

            if response.tool_calls.is_empty() {
                // Zero tool calls: the text is the final answer.
                let answer = response.content.unwrap_or_default();
                ctx.sink.append(&answer).await?;
                if !citations.is_empty() {
                    let trailer = format!(
                        "\n\nSources:\n{}",
                        citations
                            .iter()
                            .map(|u| format!("- {u}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    );
                    ctx.sink.append(&trailer).await?;
                }
                return Ok(self.result(ctx, ExitInfo::clean()));
            }

            tracing::debug!(
                job_id = %job.id,
                round,
                tool_calls = response.tool_calls.len(),
                "Tool loop round"
            );

            if let Some(ref text) = response.content
                && !text.is_empty()
            {
                ctx.sink.append(&format!("{text}\n")).await?;
            }
            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                if self.is_aborted(&job.id) {
                    return self.aborted_result(ctx).await;
                }

                ctx.sink
                    .append(&format!("→ {} {}\n", call.name, call.arguments))
                    .await?;

                match self
                    .tools
                    .call(&call.name, call.arguments.clone(), &ctx.workdir)
                    .await
                {
                    Ok(raw) => {
                        let structured = structure_tool_output(&raw);
                        ctx.sink.append(&format!("{structured}\n")).await?;
                        messages.push(ChatMessage::tool_result(call.id.clone(), structured));
                    }
                    Err(e) => {
                        // A failing tool call is reported to the model, not
                        // fatal to the job.
                        tracing::warn!(job_id = %job.id, tool = %call.name, error = %e, "Tool call failed");
                        let report = format!("Error: {e}");
                        ctx.sink.append(&format!("{report}\n")).await?;
                        messages.push(ChatMessage::tool_result(call.id.clone(), report));
                    }
                }
            }
        }

        ctx.sink
            .append(&format!(
                "\n[round limit] no final answer after {} rounds\n",
                self.config.max_rounds
            ))
            .await?;
        Ok(self.result(ctx, ExitInfo::with_signal(1, "round_limit")))
    }
}

/// Best-effort JSON structuring of tool output; raw text on parse failure.
fn structure_tool_output(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;

    use crate::channels::Notifier;
    use crate::engine::output::JobLog;
    use crate::error::{ChannelError, LlmError, ToolError};
    use crate::llm::{ToolCall, ToolCompletionResponse};
    use crate::tools::Tool;

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn send_message(&self, _chat: &str, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send_document(
            &self,
            _chat: &str,
            _path: &Path,
            _caption: &str,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    /// Replays scripted responses and records every request it sees.
    struct MockLlm {
        script: Mutex<VecDeque<ToolCompletionResponse>>,
        requests: Mutex<Vec<ToolCompletionRequest>>,
    }

    impl MockLlm {
        fn new(script: Vec<ToolCompletionResponse>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        fn model_name(&self) -> &str {
            "mock-model"
        }

        async fn complete_with_tools(
            &self,
            request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::RequestFailed {
                    provider: "mock".to_string(),
                    reason: "script exhausted".to_string(),
                })
        }
    }

    struct UpperTool;

    #[async_trait]
    impl Tool for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercase text"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            params: serde_json::Value,
            _workdir: &Path,
        ) -> Result<String, ToolError> {
            Ok(params["text"].as_str().unwrap_or_default().to_uppercase())
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _params: serde_json::Value,
            _workdir: &Path,
        ) -> Result<String, ToolError> {
            Err(ToolError::ExecutionFailed {
                name: "broken".to_string(),
                reason: "disk on fire".to_string(),
            })
        }
    }

    fn text(content: &str) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    fn tool_call(name: &str, args: serde_json::Value) -> ToolCompletionResponse {
        ToolCompletionResponse {
            tool_calls: vec![ToolCall {
                id: format!("call-{name}"),
                name: name.to_string(),
                arguments: args,
            }],
            ..Default::default()
        }
    }

    async fn registry() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(UpperTool)).await;
        registry.register(Arc::new(BrokenTool)).await;
        registry
    }

    async fn run_provider(
        llm: Arc<MockLlm>,
        job: &Job,
    ) -> (ToolLoopProvider, ExecutionResult, Arc<JobLog>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = ToolLoopProvider::new(llm, registry().await, ToolLoopConfig::default());
        let sink = Arc::new(JobLog::create(dir.path(), &job.id, 14_000).await.unwrap());
        let ctx = ExecutionContext {
            workdir: dir.path().to_path_buf(),
            sink: Arc::clone(&sink),
            chat_id: job.chat_id.clone(),
            notifier: Arc::new(SilentNotifier),
            register_handle: Arc::new(|_| {}),
        };
        let result = provider.execute(job, &ctx).await.unwrap();
        (provider, result, sink)
    }

    fn test_job() -> Job {
        Job::new("chat-1", "summarize", std::env::temp_dir(), "llm")
    }

    #[tokio::test]
    async fn text_without_tool_calls_is_final() {
        let llm = Arc::new(MockLlm::new(vec![text("all done")]));
        let (_, result, _) = run_provider(llm, &test_job()).await;

        assert_eq!(result.exit, ExitInfo::clean());
        assert!(result.output_tail.contains("all done"));
        assert_eq!(result.model.as_deref(), Some("mock-model"));
    }

    #[tokio::test]
    async fn tool_call_round_then_final() {
        let llm = Arc::new(MockLlm::new(vec![
            tool_call("upper", serde_json::json!({"text": "abc"})),
            text("finished"),
        ]));
        let (_, result, sink) = run_provider(llm.clone(), &test_job()).await;

        assert_eq!(result.exit.code, 0);
        assert!(sink.tail().contains("→ upper"));

        // The second request must carry the assistant tool-call turn and the
        // tool result.
        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        assert!(second.iter().any(|m| !m.tool_calls.is_empty()));
        assert!(
            second
                .iter()
                .any(|m| m.role == "tool" && m.content.as_deref() == Some("ABC"))
        );
    }

    #[tokio::test]
    async fn tool_failure_is_reported_to_model_not_fatal() {
        let llm = Arc::new(MockLlm::new(vec![
            tool_call("broken", serde_json::json!({})),
            text("recovered"),
        ]));
        let (_, result, _) = run_provider(llm.clone(), &test_job()).await;

        assert_eq!(result.exit.code, 0);
        let requests = llm.requests.lock().unwrap();
        let second = &requests[1].messages;
        assert!(second.iter().any(|m| {
            m.role == "tool"
                && m.content
                    .as_deref()
                    .is_some_and(|c| c.starts_with("Error:") && c.contains("disk on fire"))
        }));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_model() {
        let llm = Arc::new(MockLlm::new(vec![
            tool_call("missing", serde_json::json!({})),
            text("ok then"),
        ]));
        let (_, result, _) = run_provider(llm, &test_job()).await;
        assert_eq!(result.exit.code, 0);
    }

    #[tokio::test]
    async fn round_limit_finalizes_as_failure() {
        // Five rounds of tool calls, never a final text.
        let script: Vec<_> = (0..5)
            .map(|_| tool_call("upper", serde_json::json!({"text": "x"})))
            .collect();
        let llm = Arc::new(MockLlm::new(script));
        let (_, result, sink) = run_provider(llm, &test_job()).await;

        assert_eq!(result.exit.code, 1);
        assert_eq!(result.exit.signal.as_deref(), Some("round_limit"));
        assert!(sink.tail().contains("[round limit]"));
    }

    #[tokio::test]
    async fn abort_flag_stops_between_rounds() {
        let job = test_job();
        let llm = Arc::new(MockLlm::new(vec![text("never reached")]));
        let dir = tempfile::tempdir().unwrap();
        let provider =
            ToolLoopProvider::new(llm, registry().await, ToolLoopConfig::default());

        // Not live yet: flag is queued, no target signaled.
        assert!(!provider.abort(&job.id).await);

        let sink = Arc::new(JobLog::create(dir.path(), &job.id, 14_000).await.unwrap());
        let ctx = ExecutionContext {
            workdir: dir.path().to_path_buf(),
            sink,
            chat_id: job.chat_id.clone(),
            notifier: Arc::new(SilentNotifier),
            register_handle: Arc::new(|_| {}),
        };
        let result = provider.execute(&job, &ctx).await.unwrap();
        assert_eq!(result.exit.code, 130);
        assert_eq!(result.exit.signal.as_deref(), Some("aborted"));
    }

    #[tokio::test]
    async fn citations_are_appended_as_trailer() {
        let mut final_resp = text("cited answer");
        final_resp.citations = vec!["https://example.com/a".to_string()];
        let llm = Arc::new(MockLlm::new(vec![final_resp]));
        let (_, result, _) = run_provider(llm, &test_job()).await;

        assert!(result.output_tail.contains("Sources:"));
        assert!(result.output_tail.contains("https://example.com/a"));
    }

    #[test]
    fn structure_tool_output_pretty_prints_json() {
        let pretty = structure_tool_output(r#"{"a":1}"#);
        assert!(pretty.contains("\"a\": 1"));
        assert_eq!(structure_tool_output("plain text"), "plain text");
    }
}
