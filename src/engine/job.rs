//! Job record and state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the worker loop to pick it up.
    Queued,
    /// Currently executing. At most one job is running at any instant.
    Running,
    /// Finished with exit code 0.
    Succeeded,
    /// Finished with a nonzero code or a provider error.
    Failed,
    /// Aborted by the user. Wins races against natural completion.
    Canceled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// How an execution ended, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn clean() -> Self {
        Self {
            code: 0,
            signal: None,
        }
    }

    pub fn with_signal(code: i32, signal: impl Into<String>) -> Self {
        Self {
            code,
            signal: Some(signal.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// One user-submitted task plus its execution state.
///
/// `workdir` and `provider` are captured at enqueue time and never change
/// afterwards, so a later workspace switch by the same chat cannot move an
/// already-queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub chat_id: String,
    pub status: JobStatus,
    pub prompt: String,
    pub workdir: PathBuf,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Provider-specific runtime reference (e.g. a pid), set once execution
    /// actually begins.
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub exit: Option<ExitInfo>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Job {
    pub fn new(
        chat_id: impl Into<String>,
        prompt: impl Into<String>,
        workdir: PathBuf,
        provider: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_job_id(now),
            chat_id: chat_id.into(),
            status: JobStatus::Queued,
            prompt: prompt.into(),
            workdir,
            provider: provider.into(),
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            handle: None,
            exit: None,
            model: None,
        }
    }

    /// Apply a state transition, updating timestamps. Rejects transitions the
    /// state machine does not allow, including any write over a terminal
    /// state.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!("cannot transition from {} to {target}", self.status));
        }
        let now = Utc::now();
        match target {
            JobStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled => {
                self.finished_at = Some(now);
            }
            _ => {}
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Wall-clock runtime, if the job has started.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.started_at
            .map(|start| self.finished_at.unwrap_or_else(Utc::now) - start)
    }
}

/// Generate a job id that sorts lexicographically by creation time.
///
/// The fixed-width millisecond timestamp gives global creation order; the
/// uuid suffix keeps two jobs created in the same tick distinct and still
/// deterministically ordered.
pub fn new_job_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d%H%M%S%3f"), &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("chat-1", "do things", PathBuf::from("/tmp"), "agent")
    }

    #[test]
    fn transitions_valid() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Canceled));
    }

    #[test]
    fn transitions_invalid() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Canceled.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Canceled.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn transition_updates_timestamps() {
        let mut j = job();
        assert_eq!(j.status, JobStatus::Queued);
        assert!(j.started_at.is_none());

        j.transition_to(JobStatus::Running).unwrap();
        assert!(j.started_at.is_some());
        assert!(j.finished_at.is_none());

        j.transition_to(JobStatus::Succeeded).unwrap();
        assert!(j.finished_at.is_some());
        assert!(j.created_at <= j.started_at.unwrap());
        assert!(j.started_at.unwrap() <= j.finished_at.unwrap());
    }

    #[test]
    fn canceled_is_final() {
        let mut j = job();
        j.transition_to(JobStatus::Running).unwrap();
        j.transition_to(JobStatus::Canceled).unwrap();
        assert!(j.transition_to(JobStatus::Succeeded).is_err());
        assert!(j.transition_to(JobStatus::Failed).is_err());
        assert_eq!(j.status, JobStatus::Canceled);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let early = new_job_id("2026-01-02T03:04:05.006Z".parse().unwrap());
        let late = new_job_id("2026-01-02T03:04:05.007Z".parse().unwrap());
        assert!(early < late);
    }

    #[test]
    fn ids_unique_within_one_tick() {
        let now = Utc::now();
        let a = new_job_id(now);
        let b = new_job_id(now);
        assert_ne!(a, b);
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::Running);
    }

    #[test]
    fn exit_info_success() {
        assert!(ExitInfo::clean().is_success());
        assert!(!ExitInfo::with_signal(124, "timeout_kill").is_success());
    }
}
