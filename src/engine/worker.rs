//! Single sequential worker loop.
//!
//! One always-on cooperative scheduler: claim the oldest queued job, run it
//! through its provider, finalize, look for the next. Jobs never run
//! concurrently — the whole system is bottlenecked on one heavyweight agent
//! process or a rate-limited remote API, by design.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;

use crate::channels::Notifier;
use crate::config::EngineConfig;
use crate::engine::job::{ExitInfo, Job, JobStatus};
use crate::engine::output::{JobLog, write_metadata_snapshot};
use crate::engine::store::JobStore;
use crate::providers::{ExecutionContext, ProviderRegistry};

pub struct WorkerLoop {
    store: Arc<JobStore>,
    providers: Arc<ProviderRegistry>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    logs_dir: PathBuf,
    tail_limit: usize,
    started: AtomicBool,
}

impl WorkerLoop {
    pub fn new(
        store: Arc<JobStore>,
        providers: Arc<ProviderRegistry>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
        logs_dir: PathBuf,
        tail_limit: usize,
    ) -> Self {
        Self {
            store,
            providers,
            notifier,
            config,
            logs_dir,
            tail_limit,
            started: AtomicBool::new(false),
        }
    }

    /// Start the loop if it is not already running. Safe to call from every
    /// enqueue — racing callers start exactly one loop.
    pub fn ensure_started(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!("Starting worker loop");
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                worker.run().await;
            });
        }
    }

    async fn run(&self) {
        loop {
            let jobs = self.store.load().await;
            match oldest_queued(&jobs).cloned() {
                None => tokio::time::sleep(self.config.poll_interval).await,
                Some(job) => self.run_one(job).await,
            }
        }
    }

    /// Run one job to a terminal state. Every error path still reaches
    /// finalization — a provider failure must never leave a job `running`.
    async fn run_one(&self, job: Job) {
        // Claim: re-load and flip queued → running on fresh state.
        let mut claimed = false;
        let claim = self
            .store
            .update(&job.id, |j| {
                if j.status == JobStatus::Queued {
                    claimed = j.transition_to(JobStatus::Running).is_ok();
                }
            })
            .await;
        let job = match claim {
            Ok(Some(j)) if claimed => j,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to claim job");
                return;
            }
        };

        tracing::info!(
            job_id = %job.id,
            provider = %job.provider,
            workdir = %job.workdir.display(),
            "Job started"
        );

        let sink = match JobLog::create(&self.logs_dir, &job.id, self.tail_limit).await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to create job log");
                self.finalize(&job.id, ExitInfo::with_signal(1, "log_error"), None)
                    .await;
                return;
            }
        };

        if let Err(e) = write_metadata_snapshot(&self.logs_dir, &job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to write metadata snapshot");
        }

        let provider = self.providers.resolve(&job.provider);

        // Persist the runtime handle as soon as the provider reports one.
        // Fire-and-forget: the abort path reads the provider's own live map,
        // not this record, so a delayed write is harmless.
        let register_handle = {
            let store = Arc::clone(&self.store);
            let job_id = job.id.clone();
            Arc::new(move |handle: String| {
                let store = Arc::clone(&store);
                let job_id = job_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = store
                        .update(&job_id, |j| {
                            j.handle = Some(handle);
                            j.updated_at = Utc::now();
                        })
                        .await
                    {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to persist job handle");
                    }
                });
            })
        };

        let ctx = ExecutionContext {
            workdir: job.workdir.clone(),
            sink: Arc::clone(&sink),
            chat_id: job.chat_id.clone(),
            notifier: Arc::clone(&self.notifier),
            register_handle,
        };

        let (exit, model) = match provider.execute(&job, &ctx).await {
            Ok(result) => (result.exit, result.model),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Provider execution failed");
                let _ = sink.append(&format!("\n[provider error] {e}\n")).await;
                (ExitInfo::with_signal(1, "provider_error"), None)
            }
        };

        let finished = self.finalize(&job.id, exit, model).await;

        if let Some(finished) = finished {
            self.report(&finished, &sink).await;
        }
    }

    /// Record the terminal state. Refuses to downgrade a job that was
    /// canceled while it ran — cancellation wins the race with natural
    /// completion.
    async fn finalize(&self, job_id: &str, exit: ExitInfo, model: Option<String>) -> Option<Job> {
        let result = self
            .store
            .update(job_id, |j| {
                j.exit = Some(exit.clone());
                if let Some(ref m) = model {
                    j.model = Some(m.clone());
                }
                match j.status {
                    JobStatus::Running => {
                        let target = if exit.is_success() {
                            JobStatus::Succeeded
                        } else {
                            JobStatus::Failed
                        };
                        let _ = j.transition_to(target);
                    }
                    JobStatus::Canceled => {
                        // Already canceled externally; keep it.
                        if j.finished_at.is_none() {
                            j.finished_at = Some(Utc::now());
                        }
                        j.updated_at = Utc::now();
                    }
                    _ => {
                        j.updated_at = Utc::now();
                    }
                }
            })
            .await;

        match result {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to finalize job");
                None
            }
        }
    }

    /// One summary notification per terminal job; the full log goes along as
    /// an attachment when the output is too big for chat or the job did not
    /// succeed.
    async fn report(&self, job: &Job, sink: &JobLog) {
        let tail = sink.tail();
        let summary = render_summary(job, &tail, self.config.inline_report_limit);

        if let Err(e) = self.notifier.send_message(&job.chat_id, &summary).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to deliver job summary");
        }

        let needs_attachment =
            job.status != JobStatus::Succeeded || tail.len() > self.config.inline_report_limit;
        if needs_attachment {
            let caption = format!("Full log for job {}", job.id);
            if let Err(e) = self
                .notifier
                .send_document(&job.chat_id, sink.path(), &caption)
                .await
            {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to deliver job log");
            }
        }

        tracing::info!(job_id = %job.id, status = %job.status, "Job reported");
    }
}

/// Oldest queued job: creation time ascending, id as the deterministic
/// tie-break within one timestamp tick.
pub(crate) fn oldest_queued(jobs: &[Job]) -> Option<&Job> {
    jobs.iter()
        .filter(|j| j.status == JobStatus::Queued)
        .min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
}

fn render_summary(job: &Job, tail: &str, inline_limit: usize) -> String {
    let emoji = match job.status {
        JobStatus::Succeeded => "✅",
        JobStatus::Canceled => "🛑",
        _ => "❌",
    };
    let elapsed = job
        .elapsed()
        .map(|d| {
            let secs = d.num_seconds().max(0);
            format!("{}m{:02}s", secs / 60, secs % 60)
        })
        .unwrap_or_else(|| "?".to_string());

    let mut summary = format!("{emoji} Job `{}` {} ({elapsed})", job.id, job.status);
    if let Some(ref model) = job.model {
        summary.push_str(&format!(" · {model}"));
    }
    if let Some(ref exit) = job.exit
        && !exit.is_success()
    {
        summary.push_str(&format!(" · exit {}", exit.code));
        if let Some(ref signal) = exit.signal {
            summary.push_str(&format!(" ({signal})"));
        }
    }

    if !tail.is_empty() {
        let excerpt = tail_excerpt(tail, inline_limit);
        summary.push_str("\n\n");
        summary.push_str(&excerpt);
    }
    summary
}

/// Most recent `limit` characters of the tail, cut on a char boundary.
fn tail_excerpt(tail: &str, limit: usize) -> String {
    if tail.len() <= limit {
        return tail.to_string();
    }
    let mut start = tail.len() - limit;
    while start < tail.len() && !tail.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &tail[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job_at(prompt: &str, millis_offset: i64) -> Job {
        let mut j = Job::new("chat", prompt, PathBuf::from("/tmp"), "agent");
        j.created_at = j.created_at + chrono::Duration::milliseconds(millis_offset);
        j
    }

    #[test]
    fn oldest_queued_orders_by_creation() {
        let a = job_at("first", 0);
        let b = job_at("second", 10);
        let jobs = vec![b.clone(), a.clone()];
        assert_eq!(oldest_queued(&jobs).unwrap().prompt, "first");
    }

    #[test]
    fn oldest_queued_ties_break_on_id() {
        let mut a = job_at("a", 0);
        let mut b = job_at("b", 0);
        b.created_at = a.created_at;
        if b.id < a.id {
            std::mem::swap(&mut a, &mut b);
        }
        let jobs = vec![b.clone(), a.clone()];
        assert_eq!(oldest_queued(&jobs).unwrap().id, a.id);
    }

    #[test]
    fn oldest_queued_skips_non_queued() {
        let mut a = job_at("done", 0);
        a.transition_to(JobStatus::Running).unwrap();
        let b = job_at("waiting", 10);
        let jobs = vec![a, b];
        assert_eq!(oldest_queued(&jobs).unwrap().prompt, "waiting");
    }

    #[test]
    fn summary_mentions_status_and_exit() {
        let mut j = job_at("x", 0);
        j.transition_to(JobStatus::Running).unwrap();
        j.transition_to(JobStatus::Failed).unwrap();
        j.exit = Some(ExitInfo::with_signal(124, "timeout_kill"));

        let text = render_summary(&j, "some output", 3000);
        assert!(text.contains("failed"));
        assert!(text.contains("exit 124"));
        assert!(text.contains("timeout_kill"));
        assert!(text.contains("some output"));
    }

    #[test]
    fn summary_excerpt_keeps_most_recent() {
        let j = job_at("x", 0);
        let tail = format!("{}END", "a".repeat(5000));
        let text = render_summary(&j, &tail, 100);
        assert!(text.ends_with("END"));
        assert!(text.contains('…'));
    }
}
