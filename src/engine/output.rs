//! Per-job output capture: full append-only log file plus a bounded
//! in-memory tail.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;

use crate::engine::job::Job;
use crate::error::StoreError;

/// Fixed-size, most-recent-characters-only mirror of a job's output.
///
/// Appends are unbounded in count; memory is bounded by `limit` regardless of
/// how long the job runs. Trimming is UTF-8 boundary safe.
#[derive(Debug)]
pub struct TailBuffer {
    buf: String,
    limit: usize,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        if self.buf.len() > self.limit {
            let cut = ceil_char_boundary(&self.buf, self.buf.len() - self.limit);
            self.buf.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Find the smallest byte index >= `i` that is a valid char boundary.
fn ceil_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos < s.len() && !s.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

/// Append-only log sink for one job: the full output goes to a file under the
/// logs directory, the most recent characters are mirrored in memory.
///
/// Exclusive to its job for the job's lifetime — there is exactly one writer.
pub struct JobLog {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    tail: Mutex<TailBuffer>,
}

impl JobLog {
    /// Create (truncate) the log file for `job_id` under `dir`.
    pub async fn create(dir: &Path, job_id: &str, tail_limit: usize) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{job_id}.log"));
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            tail: Mutex::new(TailBuffer::new(tail_limit)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append text to the file and the tail mirror.
    pub async fn append(&self, text: &str) -> std::io::Result<()> {
        {
            let mut file = self.file.lock().await;
            file.write_all(text.as_bytes()).await?;
            file.flush().await?;
        }
        if let Ok(mut tail) = self.tail.lock() {
            tail.push(text);
        }
        Ok(())
    }

    /// Current bounded tail.
    pub fn tail(&self) -> String {
        self.tail
            .lock()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default()
    }
}

/// Write the one-shot audit snapshot for a job that is starting: provider,
/// prompt, workdir, and timestamps, next to its log file.
pub async fn write_metadata_snapshot(dir: &Path, job: &Job) -> Result<(), StoreError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.meta.json", job.id));
    let snapshot = serde_json::json!({
        "id": job.id,
        "chat_id": job.chat_id,
        "provider": job.provider,
        "prompt": job.prompt,
        "workdir": job.workdir,
        "created_at": job.created_at,
        "started_at": job.started_at,
    });
    tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn tail_keeps_short_input_whole() {
        let mut tail = TailBuffer::new(100);
        tail.push("hello ");
        tail.push("world");
        assert_eq!(tail.as_str(), "hello world");
    }

    #[test]
    fn tail_is_bounded() {
        let mut tail = TailBuffer::new(1000);
        for _ in 0..20 {
            tail.push(&"x".repeat(1000));
        }
        assert_eq!(tail.len(), 1000);
    }

    #[test]
    fn tail_keeps_most_recent() {
        let mut tail = TailBuffer::new(10);
        tail.push("0123456789");
        tail.push("abcde");
        assert_eq!(tail.as_str(), "56789abcde");
    }

    #[test]
    fn tail_trims_on_char_boundary() {
        let mut tail = TailBuffer::new(5);
        // é is 2 bytes; trimming must not split it.
        tail.push("aaéééé");
        assert!(tail.as_str().is_char_boundary(0));
        assert!(tail.len() <= 5);
        assert!(tail.as_str().ends_with('é'));
    }

    #[tokio::test]
    async fn log_file_holds_everything_tail_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::create(dir.path(), "job-1", 500).await.unwrap();

        for _ in 0..40 {
            log.append(&"y".repeat(500)).await.unwrap();
        }

        assert_eq!(log.tail().len(), 500);
        let on_disk = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert_eq!(on_disk.len(), 20_000);
    }

    #[tokio::test]
    async fn metadata_snapshot_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new("chat-9", "build it", PathBuf::from("/work/a"), "agent");
        write_metadata_snapshot(dir.path(), &job).await.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join(format!("{}.meta.json", job.id)))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["provider"], "agent");
        assert_eq!(value["workdir"], "/work/a");
    }
}
