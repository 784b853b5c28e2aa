// # Agent Checkpoints
//
// One opaque blob per (task, step): step index, recorded output and the
// declared compensating action. A persisted checkpoint set is sufficient to
// reconstruct agent state and resume from the next pending step, or to
// replay compensations in reverse during rollback.

use crate::error::{DbError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub step_index: usize,
    pub tool: String,
    /// Parameters the step ran with
    pub params: serde_json::Value,
    /// The step's validated output
    pub output: serde_json::Value,
    /// Compensating tool declared by the descriptor, if any
    pub compensating_tool: Option<String>,
    /// Whether the step may be left in place when no compensation exists
    pub retain_on_rollback: bool,
    pub created_at: DateTime<Utc>,
}

/// Pluggable persistence for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// All checkpoints for a task, ordered by step index.
    async fn load(&self, task_id: &str) -> Result<Vec<Checkpoint>>;

    /// Remove a task's checkpoints. Idempotent.
    async fn clear(&self, task_id: &str) -> Result<()>;
}

/// In-process store for tests and ephemeral agents.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: DashMap<String, Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut entry = self.blobs.entry(checkpoint.task_id.clone()).or_default();
        entry.retain(|c| c.step_index != checkpoint.step_index);
        entry.push(checkpoint.clone());
        entry.sort_by_key(|c| c.step_index);
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self
            .blobs
            .get(task_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn clear(&self, task_id: &str) -> Result<()> {
        self.blobs.remove(task_id);
        Ok(())
    }
}

/// File-backed store: one bincode blob per (task-id, step-index).
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.dir.join(task_id)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.task_dir(&checkpoint.task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let blob = bincode::serde::encode_to_vec(checkpoint, bincode::config::standard())?;
        let path = dir.join(format!("step-{:06}.ckpt", checkpoint.step_index));
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &blob).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "ckpt").unwrap_or(false) {
                let blob = tokio::fs::read(&path).await?;
                let (checkpoint, _): (Checkpoint, usize) =
                    bincode::serde::decode_from_slice(&blob, bincode::config::standard())
                        .map_err(|e| {
                            DbError::Serialization(format!(
                                "corrupt checkpoint {}: {}",
                                path.display(),
                                e
                            ))
                        })?;
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by_key(|c| c.step_index);
        Ok(checkpoints)
    }

    async fn clear(&self, task_id: &str) -> Result<()> {
        let dir = self.task_dir(task_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
