//! Append-only workflow journal with file-based persistence.
//!
//! Every save and archive of a workflow appends one record as
//! newline-delimited JSON (JSONL). Replaying the file in order and keeping
//! the last record per workflow reproduces the store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::lock::ResourceLock;
use crate::domain::{Workflow, WorkflowState};

/// One persisted snapshot of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub workflow: Workflow,

    /// Lock held by this workflow when the snapshot was taken
    #[serde(default)]
    pub lock: Option<ResourceLock>,

    /// Workflow moved to the archive
    #[serde(default)]
    pub archived: bool,
}

/// File-based workflow journal using JSONL format
pub struct WorkflowJournal {
    path: PathBuf,
    write: Mutex<()>,
}

impl WorkflowJournal {
    /// Create or open a journal, creating parent directories
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create journal directory: {}", parent.display()))?;
        }

        Ok(Self {
            path,
            write: Mutex::new(()),
        })
    }

    /// Get the path to the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record to the journal
    pub async fn append(&self, record: &JournalRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize journal record")?;

        let _guard = self.write.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.path.display()))?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write journal record")?;
        file.flush().await.context("Failed to flush journal")?;

        Ok(())
    }

    /// Replay all records in order
    pub async fn replay(&self) -> Result<Vec<JournalRecord>> {
        replay_file(&self.path).await
    }
}

/// Replay a journal file without opening it for writing
pub async fn replay_file(path: &Path) -> Result<Vec<JournalRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open journal: {}", path.display()))?;

    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse journal record: {}", line))?;
        records.push(record);
    }

    Ok(records)
}

/// Idempotency key for a side-effecting step
pub fn generate_idempotency_key(
    workflow_id: Uuid,
    state: &WorkflowState,
    params: &serde_json::Value,
) -> String {
    format!("{}:{}:{}", workflow_id, state.name(), hash_params(params))
}

/// Hash call parameters (first 16 hex chars of SHA256)
pub fn hash_params(params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.to_string().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnomalyState, HistoryEvent, WorkflowKind};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let journal = WorkflowJournal::open(temp.path().join("nested/journal.jsonl"))
            .await
            .unwrap();

        let mut workflow = Workflow::new(Uuid::new_v4(), "order-42", WorkflowKind::AnomalyResolution);
        for i in 0..3 {
            workflow.record(HistoryEvent::ReasoningFailed {
                attempt: i + 1,
                reason: "malformed".into(),
            });
            journal
                .append(&JournalRecord {
                    workflow: workflow.clone(),
                    lock: None,
                    archived: false,
                })
                .await
                .unwrap();
        }

        let records = journal.replay().await.unwrap();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.workflow.history.len(), i + 1);
        }
    }

    #[tokio::test]
    async fn test_replay_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let records = replay_file(&temp.path().join("none.jsonl")).await.unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_idempotency_key_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let state = WorkflowState::Anomaly(AnomalyState::Retrying);
        let key = generate_idempotency_key(id, &state, &json!({"order_id": "order-42"}));

        assert!(key.starts_with("550e8400-e29b-41d4-a716-446655440000:retrying:"));
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 16);

        assert_eq!(key, generate_idempotency_key(id, &state, &json!({"order_id": "order-42"})));
        assert_ne!(key, generate_idempotency_key(id, &state, &json!({"order_id": "order-43"})));
    }
}
