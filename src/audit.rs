//! Audit log
//!
//! Append-only JSON-Lines record of every decision and outcome. The most
//! recent entries are also kept in memory for the API.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};
use uuid::Uuid;

const RECENT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProposalCreated,
    ProposalAutoApproved,
    ProposalQueued,
    ProposalEvicted,
    ProposalDropped,
    ProposalApproved,
    ProposalRejected,
    ProposalDeferred,
    ProposalExpired,
    UpdateApplied,
    UpdateFailed,
    UpdateConfirmed,
    UpdateRolledBack,
    RollbackFailed,
    BackupsPruned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resulting_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            action,
            proposal_id: None,
            update_id: None,
            backup_id: None,
            resulting_state: None,
            details: None,
        }
    }

    pub fn proposal(mut self, id: Uuid) -> Self {
        self.proposal_id = Some(id);
        self
    }

    pub fn update(mut self, id: Uuid) -> Self {
        self.update_id = Some(id);
        self
    }

    pub fn backup(mut self, id: impl Into<String>) -> Self {
        self.backup_id = Some(id.into());
        self
    }

    /// Resulting lifecycle state, stored by its wire name
    pub fn state<S: Serialize>(mut self, state: S) -> Self {
        self.resulting_state = serde_json::to_value(state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
    recent: RwLock<VecDeque<AuditEntry>>,
}

impl AuditLog {
    /// Open the log, loading the tail of any existing file
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The log grows without bound; only its tail is held in memory
        let mut recent = VecDeque::with_capacity(RECENT_CAPACITY);
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let mut lines = BufReader::new(file).lines();
                while let Some(line) = lines.next_line().await? {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AuditEntry>(&line) {
                        Ok(entry) => {
                            if recent.len() == RECENT_CAPACITY {
                                recent.pop_front();
                            }
                            recent.push_back(entry);
                        }
                        Err(e) => debug!("Skipping malformed audit line: {}", e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            writer: Mutex::new(()),
            recent: RwLock::new(recent),
        })
    }

    /// Append an entry. Write failures are logged, never propagated.
    pub async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.append(&entry).await {
            error!("Failed to append audit entry {:?}: {}", entry.action, e);
        }

        let mut recent = self.recent.write().await;
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(entry);
    }

    async fn append(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Newest first, optionally filtered by action
    pub async fn recent(&self, limit: usize, action: Option<AuditAction>) -> Vec<AuditEntry> {
        self.recent
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| action.map_or(true, |a| e.action == a))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::ProposalState;

    #[tokio::test]
    async fn test_entries_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("decisions.jsonl");
        let log = AuditLog::open(&path).await.unwrap();

        let proposal_id = Uuid::new_v4();
        log.record(
            AuditEntry::new(AuditAction::ProposalQueued, Utc::now())
                .proposal(proposal_id)
                .state(ProposalState::Pending),
        )
        .await;
        log.record(AuditEntry::new(AuditAction::ProposalRejected, Utc::now()).proposal(proposal_id))
            .await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "proposal_queued");
        assert_eq!(first["resultingState"], "pending");

        let recent = log.recent(10, None).await;
        assert_eq!(recent[0].action, AuditAction::ProposalRejected);
        assert_eq!(log.recent(10, Some(AuditAction::ProposalQueued)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_loads_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        {
            let log = AuditLog::open(&path).await.unwrap();
            log.record(AuditEntry::new(AuditAction::BackupsPruned, Utc::now())).await;
        }
        let log = AuditLog::open(&path).await.unwrap();
        assert_eq!(log.recent(10, None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_only_the_newest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let total = RECENT_CAPACITY + 25;
        let mut text = String::new();
        for n in 0..total {
            let entry = AuditEntry::new(AuditAction::ProposalCreated, Utc::now())
                .details(serde_json::json!({ "n": n }));
            text.push_str(&serde_json::to_string(&entry).unwrap());
            text.push('\n');
            if n == 10 {
                text.push_str("{not json\n\n");
            }
        }
        std::fs::write(&path, text).unwrap();

        let log = AuditLog::open(&path).await.unwrap();
        let recent = log.recent(total, None).await;
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent[0].details.as_ref().unwrap()["n"], total - 1);
        assert_eq!(recent[RECENT_CAPACITY - 1].details.as_ref().unwrap()["n"], 25);
    }
}
