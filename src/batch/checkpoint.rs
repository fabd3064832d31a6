//! Batch checkpoint persistence

use super::types::{TaskExecution, TaskStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// Snapshot of a batch's execution records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub executions: Vec<TaskExecution>,
}

impl BatchCheckpoint {
    pub fn new(batch_id: impl Into<String>, executions: Vec<TaskExecution>) -> Self {
        Self {
            batch_id: batch_id.into(),
            created_at: Utc::now(),
            executions,
        }
    }

    /// Records of tasks that finished successfully
    pub fn completed(&self) -> impl Iterator<Item = &TaskExecution> {
        self.executions
            .iter()
            .filter(|e| e.status == TaskStatus::Completed)
    }
}

/// Storage backend for batch checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, batch_id: &str, checkpoint: &BatchCheckpoint) -> Result<()>;

    /// Latest checkpoint for the batch, if any
    async fn load(&self, batch_id: &str) -> Result<Option<BatchCheckpoint>>;
}

/// Process-local checkpoint store
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, BatchCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, batch_id: &str, checkpoint: &BatchCheckpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .insert(batch_id.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, batch_id: &str) -> Result<Option<BatchCheckpoint>> {
        Ok(self.checkpoints.lock().get(batch_id).cloned())
    }
}

/// One JSON file per batch under a base directory
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn checkpoint_path(&self, batch_id: &str) -> PathBuf {
        let safe: String = batch_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{safe}.checkpoint.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, batch_id: &str, checkpoint: &BatchCheckpoint) -> Result<()> {
        let path = self.checkpoint_path(batch_id);
        fs::create_dir_all(&self.base_path)
            .await
            .with_context(|| format!("Failed to create {}", self.base_path.display()))?;

        let json = serde_json::to_vec_pretty(checkpoint)?;

        // Write atomically using temp file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn load(&self, batch_id: &str) -> Result<Option<BatchCheckpoint>> {
        let path = self.checkpoint_path(batch_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = fs::read(&path).await?;
        let checkpoint = serde_json::from_slice(&data)
            .with_context(|| format!("Corrupt checkpoint at {}", path.display()))?;
        Ok(Some(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::Task;
    use serde_json::json;

    fn sample(batch_id: &str) -> BatchCheckpoint {
        let mut done = TaskExecution::new(Task::new("t1", "eval", json!({})));
        done.status = TaskStatus::Completed;
        let failed = TaskExecution::new(Task::new("t2", "eval", json!({})));
        BatchCheckpoint::new(batch_id, vec![done, failed])
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load("b").await.unwrap().is_none());
        store.save("b", &sample("b")).await.unwrap();
        let loaded = store.load("b").await.unwrap().unwrap();
        assert_eq!(loaded.completed().count(), 1);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = sample("batch/1");
        FileCheckpointStore::new(dir.path())
            .save("batch/1", &checkpoint)
            .await
            .unwrap();

        let reopened = FileCheckpointStore::new(dir.path());
        let loaded = reopened.load("batch/1").await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(reopened.load("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        tokio::fs::write(dir.path().join("bad.checkpoint.json"), b"{not json")
            .await
            .unwrap();
        assert!(store.load("bad").await.is_err());
    }
}
