//! Execution backends.
//!
//! A provider is the capability pair `{execute, abort}`. Backend-specific
//! behavior — process timeouts, heartbeats, round limits — lives entirely
//! inside each implementation; the worker loop only dispatches and
//! finalizes.

pub mod local_agent;
pub mod tool_loop;

pub use local_agent::LocalAgentProvider;
pub use tool_loop::ToolLoopProvider;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channels::Notifier;
use crate::engine::job::{ExitInfo, Job};
use crate::engine::output::JobLog;
use crate::error::ProviderError;

/// Callback through which a provider reports its live runtime handle (e.g. a
/// pid) as soon as one exists, so cancellation can act on it before the job
/// record has been re-persisted.
pub type HandleCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Everything a provider needs to run one job.
pub struct ExecutionContext {
    /// Directory the job executes in, captured at enqueue time.
    pub workdir: PathBuf,
    /// Append-only log sink, exclusive to this job.
    pub sink: Arc<JobLog>,
    /// Chat to send progress heartbeats to.
    pub chat_id: String,
    pub notifier: Arc<dyn Notifier>,
    pub register_handle: HandleCallback,
}

/// Outcome of one provider execution. Not persisted as-is; the worker loop
/// folds it into the job record.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Bounded most-recent output.
    pub output_tail: String,
    pub exit: ExitInfo,
    /// Model label, when the backend has one.
    pub model: Option<String>,
    pub provider: String,
}

/// An execution backend capable of running a job and being aborted mid-flight.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the job to completion. Raising a `ProviderError` is treated by the
    /// caller as an execution failure, never a crash.
    async fn execute(
        &self,
        job: &Job,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, ProviderError>;

    /// Best-effort cancellation. Idempotent and safe after the job has
    /// finished. Returns whether a live target was found and signaled.
    async fn abort(&self, job_id: &str) -> bool;
}

/// Resolves a provider name to an instance; unknown names fall back to the
/// default.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default: String,
}

impl ProviderRegistry {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default: default.into(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Look up a provider by name, falling back to the default for unknown
    /// names. Panics only if the default itself was never registered, which
    /// is a wiring bug caught at startup.
    pub fn resolve(&self, name: &str) -> Arc<dyn Provider> {
        if let Some(p) = self.providers.get(name) {
            return Arc::clone(p);
        }
        tracing::warn!(provider = %name, default = %self.default, "Unknown provider, using default");
        Arc::clone(&self.providers[&self.default])
    }

    /// The name `resolve` will actually use for `requested`.
    pub fn effective_name(&self, requested: &str) -> String {
        if self.providers.contains_key(requested) {
            requested.to_string()
        } else {
            self.default.clone()
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
