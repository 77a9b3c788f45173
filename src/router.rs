//! Command router — maps incoming chat text to engine calls.
//!
//! Malformed input is answered in-chat here; the engine never sees it.

use std::path::PathBuf;
use std::sync::Arc;

use crate::archive;
use crate::channels::{IncomingMessage, Notifier};
use crate::engine::{CancelOutcome, Engine, EnqueueOptions, Job};

/// Parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enqueue on the default provider.
    Task(String),
    /// Enqueue on the tool-loop provider.
    Llm(String),
    Cancel(String),
    Status(Option<String>),
    Jobs,
    Repos,
    Repo(String),
    Export,
    Help,
    /// Anything unparseable.
    Unknown(String),
}

/// Parse one chat message into a command. Non-command text is a task.
pub fn parse_command(text: &str) -> Command {
    let text = text.trim();
    if !text.starts_with('/') {
        if text.is_empty() {
            return Command::Unknown(String::new());
        }
        return Command::Task(text.to_string());
    }

    let (head, rest) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    };

    match head {
        "/task" if !rest.is_empty() => Command::Task(rest.to_string()),
        "/llm" if !rest.is_empty() => Command::Llm(rest.to_string()),
        "/cancel" if !rest.is_empty() => Command::Cancel(rest.to_string()),
        "/status" => Command::Status((!rest.is_empty()).then(|| rest.to_string())),
        "/jobs" => Command::Jobs,
        "/repos" => Command::Repos,
        "/repo" if !rest.is_empty() => Command::Repo(rest.to_string()),
        "/export" => Command::Export,
        "/help" | "/start" => Command::Help,
        _ => Command::Unknown(text.to_string()),
    }
}

const HELP_TEXT: &str = "Send any text to run it as a task in the current workspace.\n\
Commands:\n\
/task <prompt> — run with the local coding agent\n\
/llm <prompt> — run with the remote model tool loop\n\
/cancel <job-id> — cancel the running job\n\
/status [job-id] — job details, or the current queue\n\
/jobs — your recent jobs\n\
/repos — list workspaces\n\
/repo <name> — switch workspace\n\
/export — download the current workspace as .tar.gz";

pub struct Router {
    engine: Arc<Engine>,
    notifier: Arc<dyn Notifier>,
    export_dir: PathBuf,
}

impl Router {
    pub fn new(engine: Arc<Engine>, notifier: Arc<dyn Notifier>, export_dir: PathBuf) -> Self {
        Self {
            engine,
            notifier,
            export_dir,
        }
    }

    /// Handle one inbound message end to end, replying in-chat.
    pub async fn handle(&self, msg: IncomingMessage) {
        let chat_id = msg.chat_id.clone();
        let reply = match parse_command(&msg.text) {
            Command::Task(prompt) => self.enqueue(&chat_id, &prompt, None).await,
            Command::Llm(prompt) => self.enqueue(&chat_id, &prompt, Some("llm")).await,
            Command::Cancel(job_id) => self.cancel(&chat_id, &job_id).await,
            Command::Status(job_id) => self.status(&chat_id, job_id.as_deref()).await,
            Command::Jobs => self.jobs(&chat_id).await,
            Command::Repos => self.repos(&chat_id).await,
            Command::Repo(name) => self.select_repo(&chat_id, &name).await,
            Command::Export => self.export(&chat_id).await,
            Command::Help => HELP_TEXT.to_string(),
            Command::Unknown(text) => {
                format!("Unrecognized command: {text}\n\n{HELP_TEXT}")
            }
        };

        if let Err(e) = self.notifier.send_message(&chat_id, &reply).await {
            tracing::warn!(chat_id = %chat_id, error = %e, "Failed to send router reply");
        }
    }

    async fn enqueue(&self, chat_id: &str, prompt: &str, provider: Option<&str>) -> String {
        let options = EnqueueOptions {
            provider: provider.map(str::to_string),
        };
        match self.engine.enqueue(chat_id, prompt, options).await {
            Ok(receipt) => format!(
                "Queued job `{}` on `{}`\nWorkspace: {}",
                receipt.job_id,
                receipt.provider,
                receipt.workdir.display()
            ),
            Err(e) => {
                tracing::error!(chat_id = %chat_id, error = %e, "Enqueue failed");
                format!("Failed to queue job: {e}")
            }
        }
    }

    async fn cancel(&self, chat_id: &str, job_id: &str) -> String {
        match self.engine.cancel(chat_id, job_id).await {
            CancelOutcome::Canceled { signaled: true } => {
                format!("Canceling job `{job_id}`…")
            }
            CancelOutcome::Canceled { signaled: false } => {
                format!("Job `{job_id}` marked canceled (no live process to signal)")
            }
            CancelOutcome::NotFound => format!("No job `{job_id}` found for this chat"),
            CancelOutcome::NotRunning => {
                format!("Job `{job_id}` is not running; only running jobs can be canceled")
            }
        }
    }

    async fn status(&self, chat_id: &str, job_id: Option<&str>) -> String {
        match job_id {
            Some(id) => match self.engine.get_job(id).await {
                Some(job) if job.chat_id == chat_id => describe_job(&job),
                _ => format!("No job `{id}` found for this chat"),
            },
            None => {
                let jobs = self.engine.list_recent_jobs(chat_id, 5).await;
                let active: Vec<&Job> =
                    jobs.iter().filter(|j| !j.status.is_terminal()).collect();
                if active.is_empty() {
                    "No queued or running jobs".to_string()
                } else {
                    active.iter().map(|j| describe_job(j)).collect::<Vec<_>>().join("\n\n")
                }
            }
        }
    }

    async fn jobs(&self, chat_id: &str) -> String {
        let jobs = self.engine.list_recent_jobs(chat_id, 10).await;
        if jobs.is_empty() {
            return "No jobs yet".to_string();
        }
        jobs.iter()
            .map(|j| format!("`{}` — {} — {}", j.id, j.status, first_line(&j.prompt)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn repos(&self, chat_id: &str) -> String {
        match self.engine.workspaces().list().await {
            Ok(names) if names.is_empty() => "No workspaces available".to_string(),
            Ok(names) => {
                let current = self.engine.workspaces().current(chat_id).await;
                names
                    .iter()
                    .map(|n| {
                        if current.as_deref() == Some(n) {
                            format!("▸ {n} (current)")
                        } else {
                            format!("  {n}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Err(e) => format!("Failed to list workspaces: {e}"),
        }
    }

    async fn select_repo(&self, chat_id: &str, name: &str) -> String {
        match self.engine.workspaces().select(chat_id, name).await {
            Ok(path) => format!("Workspace switched to `{name}` ({})", path.display()),
            Err(e) => format!("Cannot switch workspace: {e}"),
        }
    }

    async fn export(&self, chat_id: &str) -> String {
        let workdir = self.engine.workspaces().resolve(chat_id).await;
        match archive::export_workspace(&workdir, &self.export_dir).await {
            Ok(path) => {
                let caption = format!("Export of {}", workdir.display());
                match self.notifier.send_document(chat_id, &path, &caption).await {
                    Ok(()) => "Workspace exported".to_string(),
                    Err(e) => format!("Export built but delivery failed: {e}"),
                }
            }
            Err(e) => format!("Export failed: {e}"),
        }
    }
}

fn describe_job(job: &Job) -> String {
    let mut lines = vec![
        format!("Job `{}`", job.id),
        format!("Status: {}", job.status),
        format!("Provider: {}", job.provider),
        format!("Workspace: {}", job.workdir.display()),
        format!("Prompt: {}", first_line(&job.prompt)),
    ];
    if let Some(ref exit) = job.exit {
        let signal = exit
            .signal
            .as_deref()
            .map(|s| format!(" ({s})"))
            .unwrap_or_default();
        lines.push(format!("Exit: {}{signal}", exit.code));
    }
    lines.join("\n")
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_task() {
        assert_eq!(
            parse_command("fix the failing test"),
            Command::Task("fix the failing test".to_string())
        );
    }

    #[test]
    fn task_and_llm_need_a_prompt() {
        assert_eq!(
            parse_command("/task do it"),
            Command::Task("do it".to_string())
        );
        assert_eq!(parse_command("/llm ask"), Command::Llm("ask".to_string()));
        assert!(matches!(parse_command("/task"), Command::Unknown(_)));
        assert!(matches!(parse_command("/llm"), Command::Unknown(_)));
    }

    #[test]
    fn cancel_requires_an_id() {
        assert_eq!(
            parse_command("/cancel job-1"),
            Command::Cancel("job-1".to_string())
        );
        assert!(matches!(parse_command("/cancel"), Command::Unknown(_)));
    }

    #[test]
    fn status_id_is_optional() {
        assert_eq!(parse_command("/status"), Command::Status(None));
        assert_eq!(
            parse_command("/status job-2"),
            Command::Status(Some("job-2".to_string()))
        );
    }

    #[test]
    fn workspace_commands() {
        assert_eq!(parse_command("/repos"), Command::Repos);
        assert_eq!(parse_command("/repo api"), Command::Repo("api".to_string()));
        assert_eq!(parse_command("/export"), Command::Export);
    }

    #[test]
    fn help_and_unknown() {
        assert_eq!(parse_command("/help"), Command::Help);
        assert_eq!(parse_command("/start"), Command::Help);
        assert!(matches!(parse_command("/frobnicate"), Command::Unknown(_)));
        assert!(matches!(parse_command("   "), Command::Unknown(_)));
    }

    #[test]
    fn first_line_truncates_multiline_prompts() {
        assert_eq!(first_line("one\ntwo"), "one");
        assert_eq!(first_line(""), "");
    }
}
