//! Job execution engine: durable queue, sequential worker, provider dispatch.

pub mod job;
pub mod output;
pub mod store;
pub mod worker;

pub use job::{ExitInfo, Job, JobStatus};
pub use store::JobStore;
pub use worker::WorkerLoop;

use std::path::PathBuf;
use std::sync::Arc;

use crate::channels::Notifier;
use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::providers::ProviderRegistry;
use crate::workspace::WorkspaceManager;

/// Options accepted at enqueue time.
#[derive(Debug, Default, Clone)]
pub struct EnqueueOptions {
    /// Execution backend override; the default provider otherwise.
    pub provider: Option<String>,
}

/// What the caller gets back from `enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub job_id: String,
    pub workdir: PathBuf,
    pub provider: String,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was marked canceled. `signaled` reports whether a live
    /// execution target was found and signaled.
    Canceled { signaled: bool },
    /// No such job, or it belongs to a different chat.
    NotFound,
    /// The job is not currently running. Canceling a still-queued job is
    /// deliberately unsupported; callers see this reason instead of a silent
    /// no-op.
    NotRunning,
}

/// Facade the command router talks to.
pub struct Engine {
    store: Arc<JobStore>,
    providers: Arc<ProviderRegistry>,
    workspaces: Arc<WorkspaceManager>,
    worker: Arc<WorkerLoop>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<JobStore>,
        providers: Arc<ProviderRegistry>,
        workspaces: Arc<WorkspaceManager>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
        logs_dir: PathBuf,
        tail_limit: usize,
    ) -> Self {
        let worker = Arc::new(WorkerLoop::new(
            Arc::clone(&store),
            Arc::clone(&providers),
            notifier,
            config.clone(),
            logs_dir,
            tail_limit,
        ));
        Self {
            store,
            providers,
            workspaces,
            worker,
            config,
        }
    }

    /// Create a queued job and make sure the worker loop is running.
    ///
    /// The workdir and provider are resolved here, once, and are immutable on
    /// the record from then on.
    pub async fn enqueue(
        &self,
        chat_id: &str,
        prompt: &str,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt, StoreError> {
        let workdir = self.workspaces.resolve(chat_id).await;
        let requested = options
            .provider
            .unwrap_or_else(|| self.config.default_provider.clone());
        let provider = self.providers.effective_name(&requested);

        let job = Job::new(chat_id, prompt, workdir.clone(), provider.clone());
        self.store.upsert(job.clone()).await?;
        self.worker.ensure_started();

        tracing::info!(
            job_id = %job.id,
            chat_id = %chat_id,
            provider = %provider,
            workdir = %workdir.display(),
            "Job enqueued"
        );

        Ok(EnqueueReceipt {
            job_id: job.id,
            workdir,
            provider,
        })
    }

    /// Cancel a running job owned by `chat_id`.
    ///
    /// The canceled status is persisted *before* the provider's abort: the
    /// worker's finalization re-loads the record before writing, so once the
    /// mark is down a racing natural completion can no longer downgrade the
    /// job to succeeded/failed.
    pub async fn cancel(&self, chat_id: &str, job_id: &str) -> CancelOutcome {
        let Some(job) = self.store.get(job_id).await else {
            return CancelOutcome::NotFound;
        };
        if job.chat_id != chat_id {
            return CancelOutcome::NotFound;
        }
        if job.status != JobStatus::Running {
            return CancelOutcome::NotRunning;
        }

        let mut marked = false;
        let write = self
            .store
            .update(job_id, |j| {
                if j.status == JobStatus::Running {
                    marked = j.transition_to(JobStatus::Canceled).is_ok();
                }
            })
            .await;
        if let Err(e) = write {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist cancellation");
        }
        if !marked {
            // Finished between our read and the write.
            return CancelOutcome::NotRunning;
        }

        let provider = self.providers.resolve(&job.provider);
        let signaled = provider.abort(&job.id).await;

        tracing::info!(job_id = %job_id, signaled, "Job canceled");
        CancelOutcome::Canceled { signaled }
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id).await
    }

    /// Most recent jobs for a chat, newest first.
    pub async fn list_recent_jobs(&self, chat_id: &str, limit: usize) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .store
            .load()
            .await
            .into_iter()
            .filter(|j| j.chat_id == chat_id)
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit);
        jobs
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }
}
