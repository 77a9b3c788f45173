//! Workspace (repository checkout) selection.
//!
//! A flat root directory holds one subdirectory per checkout. Each chat can
//! select one; the engine resolves the selection exactly once, at enqueue
//! time, so a later switch never moves an already-queued job.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::RwLock;

use crate::error::WorkspaceError;

pub struct WorkspaceManager {
    root: PathBuf,
    /// chat id → selected checkout name.
    selected: RwLock<HashMap<String, String>>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            selected: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// List available checkouts (subdirectory names), sorted.
    pub async fn list(&self) -> Result<Vec<String>, WorkspaceError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                if name.starts_with('.') {
                    continue;
                }
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Select a checkout for a chat. The directory must exist.
    pub async fn select(&self, chat_id: &str, name: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.root.join(name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(WorkspaceError::NotFound {
                name: name.to_string(),
            });
        }
        self.selected
            .write()
            .await
            .insert(chat_id.to_string(), name.to_string());
        tracing::info!(chat_id = %chat_id, workspace = %name, "Workspace selected");
        Ok(path)
    }

    /// Current working directory for a chat: its selection, or the root when
    /// nothing is selected.
    pub async fn resolve(&self, chat_id: &str) -> PathBuf {
        match self.selected.read().await.get(chat_id) {
            Some(name) => self.root.join(name),
            None => self.root.clone(),
        }
    }

    /// Name of the chat's current selection, if any.
    pub async fn current(&self, chat_id: &str) -> Option<String> {
        self.selected.read().await.get(chat_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager_with(dirs: &[&str]) -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        for d in dirs {
            tokio::fs::create_dir(dir.path().join(d)).await.unwrap();
        }
        let manager = WorkspaceManager::new(dir.path().to_path_buf());
        (dir, manager)
    }

    #[tokio::test]
    async fn lists_checkouts_sorted() {
        let (_dir, manager) = manager_with(&["zeta", "alpha"]).await;
        assert_eq!(manager.list().await.unwrap(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn hidden_dirs_are_skipped() {
        let (_dir, manager) = manager_with(&[".git", "repo"]).await;
        assert_eq!(manager.list().await.unwrap(), vec!["repo"]);
    }

    #[tokio::test]
    async fn select_and_resolve_per_chat() {
        let (dir, manager) = manager_with(&["a", "b"]).await;

        assert_eq!(manager.resolve("chat-1").await, dir.path());

        manager.select("chat-1", "a").await.unwrap();
        assert_eq!(manager.resolve("chat-1").await, dir.path().join("a"));
        assert_eq!(manager.current("chat-1").await.as_deref(), Some("a"));

        // Other chats are unaffected.
        assert_eq!(manager.resolve("chat-2").await, dir.path());
    }

    #[tokio::test]
    async fn select_missing_checkout_fails() {
        let (_dir, manager) = manager_with(&["a"]).await;
        let err = manager.select("chat-1", "nope").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound { .. }));
    }
}
