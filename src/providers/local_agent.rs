//! Local coding-agent provider — spawns an external agent CLI as a child
//! process and supervises it: streamed output capture, heartbeats, a hard
//! wall-clock timeout, and forced cancellation.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::channels::Notifier;
use crate::config::AgentConfig;
use crate::engine::job::{ExitInfo, Job};
use crate::engine::output::JobLog;
use crate::error::ProviderError;
use crate::providers::{ExecutionContext, ExecutionResult, Provider};

/// Constraints prepended to every prompt handed to the agent CLI.
const OPERATING_PREAMBLE: &str = "Operating constraints: keep output concise; \
do not print large diffs or full file contents inline; prefer small focused \
commits; if you create a pull request, print its URL.";

/// Terminal escape sequences stripped from captured output.
static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex"));

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Canceled,
    TimedOut,
}

pub struct LocalAgentProvider {
    config: AgentConfig,
    /// Live kill switches keyed by job id, present only while the child
    /// process exists.
    running: Mutex<HashMap<String, CancellationToken>>,
    /// Jobs aborted before their process handle was registered. Checked at
    /// registration time so the cancel is not lost to the startup race.
    pending_cancel: Mutex<HashSet<String>>,
}

impl LocalAgentProvider {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            running: Mutex::new(HashMap::new()),
            pending_cancel: Mutex::new(HashSet::new()),
        }
    }

    fn full_prompt(&self, prompt: &str) -> String {
        format!("{OPERATING_PREAMBLE}\n\n{prompt}")
    }

    /// Track a freshly spawned process. Returns a cancellation token that
    /// fires immediately if an abort arrived before the handle existed.
    fn track(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut running) = self.running.lock() {
            running.insert(job_id.to_string(), token.clone());
        }
        let was_pending = self
            .pending_cancel
            .lock()
            .map(|mut p| p.remove(job_id))
            .unwrap_or(false);
        if was_pending {
            tracing::info!(job_id = %job_id, "Applying cancel that arrived before spawn");
            token.cancel();
        }
        token
    }

    fn untrack(&self, job_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(job_id);
        }
        if let Ok(mut pending) = self.pending_cancel.lock() {
            pending.remove(job_id);
        }
    }
}

#[async_trait]
impl Provider for LocalAgentProvider {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, ProviderError> {
        let mut child = match Command::new(&self.config.command)
            .args(&self.config.args)
            .arg(self.full_prompt(&job.prompt))
            .current_dir(&ctx.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                ctx.sink
                    .append(&format!("[spawn error] {}: {e}\n", self.config.command))
                    .await?;
                return Ok(ExecutionResult {
                    output_tail: ctx.sink.tail(),
                    exit: ExitInfo::with_signal(1, "spawn_error"),
                    model: None,
                    provider: self.name().to_string(),
                });
            }
        };

        let pid = child.id().unwrap_or_default();
        (ctx.register_handle)(pid.to_string());
        let token = self.track(&job.id);

        // Drain both pipes to the sink for the whole lifetime of the child.
        let mut drains = Vec::new();
        if let Some(out) = child.stdout.take() {
            drains.push(tokio::spawn(drain(out, Arc::clone(&ctx.sink))));
        }
        if let Some(err) = child.stderr.take() {
            drains.push(tokio::spawn(drain(err, Arc::clone(&ctx.sink))));
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&ctx.notifier),
            ctx.chat_id.clone(),
            job.id.clone(),
            self.config.clone(),
        ));

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = token.cancelled() => WaitOutcome::Canceled,
            _ = tokio::time::sleep(self.config.timeout) => WaitOutcome::TimedOut,
        };

        let exit = match outcome {
            WaitOutcome::Exited(Ok(status)) => exit_info_from_status(status),
            WaitOutcome::Exited(Err(e)) => {
                ctx.sink.append(&format!("[wait error] {e}\n")).await?;
                ExitInfo::with_signal(1, "wait_error")
            }
            WaitOutcome::Canceled => {
                let _ = child.kill().await;
                ctx.sink.append("\n[canceled] job aborted, agent process killed\n").await?;
                ExitInfo::with_signal(130, "killed")
            }
            WaitOutcome::TimedOut => {
                ctx.sink
                    .append(&format!(
                        "\n[timeout] wall-clock limit of {}s reached, killing agent\n",
                        self.config.timeout.as_secs()
                    ))
                    .await?;
                let _ = child.kill().await;
                ExitInfo::with_signal(124, "timeout_kill")
            }
        };

        heartbeat.abort();
        for result in futures::future::join_all(drains).await {
            let _ = result;
        }
        self.untrack(&job.id);

        tracing::info!(job_id = %job.id, pid = pid, code = exit.code, "Agent process finished");

        Ok(ExecutionResult {
            output_tail: ctx.sink.tail(),
            exit,
            model: None,
            provider: self.name().to_string(),
        })
    }

    async fn abort(&self, job_id: &str) -> bool {
        if let Ok(running) = self.running.lock()
            && let Some(token) = running.get(job_id)
        {
            token.cancel();
            return true;
        }
        // No live process yet — remember the cancel for registration time.
        if let Ok(mut pending) = self.pending_cancel.lock() {
            pending.insert(job_id.to_string());
        }
        false
    }
}

/// Copy one pipe to the log sink until EOF, stripping terminal escapes.
async fn drain(mut reader: impl tokio::io::AsyncRead + Unpin, sink: Arc<JobLog>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let clean = ANSI_ESCAPE_RE.replace_all(&text, "");
                if let Err(e) = sink.append(&clean).await {
                    tracing::warn!(error = %e, "Failed to append agent output to log");
                    break;
                }
            }
        }
    }
}

/// Send a progress notification whenever `heartbeat_interval` has elapsed
/// since the last one. Runs on a faster check cadence and measures elapsed
/// time rather than counting ticks, so it self-corrects if the cadence
/// drifts.
async fn heartbeat_loop(
    notifier: Arc<dyn Notifier>,
    chat_id: String,
    job_id: String,
    config: AgentConfig,
) {
    let started = Instant::now();
    let mut last_beat = Instant::now();
    loop {
        tokio::time::sleep(config.heartbeat_check).await;
        if last_beat.elapsed() >= config.heartbeat_interval {
            let minutes = started.elapsed().as_secs() / 60;
            let seconds = started.elapsed().as_secs() % 60;
            let text = format!("⏳ Job `{job_id}` still running ({minutes}m{seconds:02}s)");
            if let Err(e) = notifier.send_message(&chat_id, &text).await {
                tracing::debug!(error = %e, "Heartbeat delivery failed");
            }
            last_beat = Instant::now();
        }
    }
}

fn exit_info_from_status(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitInfo::with_signal(128 + sig, format!("signal_{sig}"));
        }
    }
    ExitInfo {
        code: status.code().unwrap_or(-1),
        signal: None,
    }
}
