//! Durable job collection backed by a single JSON document.
//!
//! Every operation is whole-document: `load` reads and deserializes the full
//! collection, `save` rewrites it. A missing or corrupt file loads as an
//! empty collection — availability is preferred over strict durability.
//!
//! Writers inside this process are serialized by an internal mutex, and the
//! read-modify-write helpers re-load the document immediately before
//! mutating, so the worker loop and the engine facade cannot clobber each
//! other. A second *process* writing the same file is still last-write-wins;
//! that limitation is deliberate.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::engine::job::Job;
use crate::error::StoreError;

pub struct JobStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full job collection. Missing or malformed documents yield an
    /// empty collection instead of an error.
    pub async fn load(&self) -> Vec<Job> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read job store");
                return Vec::new();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Job store document is corrupt, treating as empty"
                );
                Vec::new()
            }
        }
    }

    /// Rewrite the full job collection.
    pub async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(jobs)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    /// Fetch one job by id.
    pub async fn get(&self, id: &str) -> Option<Job> {
        self.load().await.into_iter().find(|j| j.id == id)
    }

    /// Insert or replace a job record.
    pub async fn upsert(&self, job: Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load().await;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => jobs.push(job),
        }
        self.save(&jobs).await
    }

    /// Re-load the document, apply `mutate` to the record with `id`, and
    /// save. Returns the mutated job, or `None` if no such record exists.
    ///
    /// This is the read-modify-write primitive every concurrent caller must
    /// use so its update is applied to the freshest state.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Option<Job>, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(None);
        };
        mutate(job);
        let updated = job.clone();
        self.save(&jobs).await?;
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::job::JobStatus;
    use std::path::PathBuf;

    fn store(dir: &tempfile::TempDir) -> JobStore {
        JobStore::new(dir.path().join("jobs.json"))
    }

    fn job(prompt: &str) -> Job {
        Job::new("chat-1", prompt, PathBuf::from("/tmp"), "agent")
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        tokio::fs::write(s.path(), b"{ not json ]").await.unwrap();
        assert!(s.load().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let j = job("first");
        s.upsert(j.clone()).await.unwrap();

        let loaded = s.get(&j.id).await.unwrap();
        assert_eq!(loaded.prompt, "first");
        assert_eq!(loaded.status, JobStatus::Queued);

        // Replacing by id keeps a single record.
        let mut j2 = loaded;
        j2.transition_to(JobStatus::Running).unwrap();
        s.upsert(j2).await.unwrap();
        assert_eq!(s.load().await.len(), 1);
        assert_eq!(s.get(&j.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn update_reloads_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let j = job("task");
        s.upsert(j.clone()).await.unwrap();

        let updated = s
            .update(&j.id, |record| {
                record.handle = Some("4242".to_string());
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.handle.as_deref(), Some("4242"));
        assert_eq!(s.get(&j.id).await.unwrap().handle.as_deref(), Some("4242"));
    }

    #[tokio::test]
    async fn update_unknown_id_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let result = s.update("nope", |_| {}).await.unwrap();
        assert!(result.is_none());
    }
}
