//! Backup storage
//!
//! One JSON file per backup under the backups directory. The original bytes
//! are stored as text together with their SHA-256 so a restore can prove it
//! is writing back exactly what was there.

use crate::error::{not_found_error, AppError};
use crate::fsutil::atomic_write;
use crate::proposal::ChangeOp;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lowercase hex SHA-256 of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Backup metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBackup {
    pub backup_id: String,
    pub target_resource: String,
    pub checksum: String,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub change_set: Vec<ChangeOp>,
    pub update_id: Option<uuid::Uuid>,
}

/// On-disk layout of a backup file
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupFile {
    metadata: ConfigBackup,
    original_content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub kept_referenced: usize,
}

pub struct BackupStore {
    dir: PathBuf,
    index: RwLock<HashMap<String, ConfigBackup>>,
}

impl BackupStore {
    /// Open the store, indexing any backup files already on disk
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_backup_file(&path).await {
                Ok(file) => {
                    index.insert(file.metadata.backup_id.clone(), file.metadata);
                }
                Err(e) => warn!("Skipping unreadable backup {}: {}", path.display(), e),
            }
        }

        if !index.is_empty() {
            info!("Indexed {} existing backups in {}", index.len(), dir.display());
        }
        Ok(Self { dir, index: RwLock::new(index) })
    }

    fn path_for(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", backup_id))
    }

    /// Snapshot `content` of `resource` before a change is written
    pub async fn create(
        &self,
        resource: &str,
        content: &[u8],
        change_set: &[ChangeOp],
        update_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConfigBackup, AppError> {
        let original_content = String::from_utf8(content.to_vec())
            .map_err(|_| AppError::Apply(format!("{} is not valid UTF-8", resource)))?;

        let backup_id = format!(
            "backup_{}_{}_{}",
            resource.replace(['/', '\\', '.'], "_"),
            now.format("%Y%m%d_%H%M%S"),
            &update_id.simple().to_string()[..8]
        );

        let metadata = ConfigBackup {
            backup_id: backup_id.clone(),
            target_resource: resource.to_string(),
            checksum: checksum(content),
            size_bytes: content.len(),
            created_at: now,
            change_set: change_set.to_vec(),
            update_id: Some(update_id),
        };

        let file = BackupFile { metadata: metadata.clone(), original_content };
        let bytes = serde_json::to_vec_pretty(&file)?;
        atomic_write(&self.path_for(&backup_id), &bytes).await?;

        self.index.write().await.insert(backup_id.clone(), metadata.clone());
        debug!("Created backup {} for {}", backup_id, resource);
        Ok(metadata)
    }

    /// Load original bytes from disk and re-verify the checksum
    pub async fn restore_bytes(&self, backup_id: &str) -> Result<Vec<u8>, AppError> {
        let path = self.path_for(backup_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AppError::Rollback(format!("Backup {} is missing", backup_id)));
        }

        let file = read_backup_file(&path)
            .await
            .map_err(|e| AppError::Rollback(format!("Backup {} unreadable: {}", backup_id, e)))?;

        let bytes = file.original_content.into_bytes();
        let actual = checksum(&bytes);
        if actual != file.metadata.checksum {
            return Err(AppError::Rollback(format!(
                "Backup {} failed checksum verification (expected {}, got {})",
                backup_id, file.metadata.checksum, actual
            )));
        }
        Ok(bytes)
    }

    pub async fn get(&self, backup_id: &str) -> Result<ConfigBackup, AppError> {
        self.index
            .read()
            .await
            .get(backup_id)
            .cloned()
            .ok_or_else(|| not_found_error(format!("Backup {} not found", backup_id)))
    }

    /// Backup history, newest first, optionally for one resource
    pub async fn list(&self, resource: Option<&str>) -> Vec<ConfigBackup> {
        let index = self.index.read().await;
        let mut backups: Vec<_> = index
            .values()
            .filter(|b| resource.map_or(true, |r| b.target_resource == r))
            .cloned()
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    pub async fn count(&self) -> usize {
        self.index.read().await.len()
    }

    /// Delete backups older than `retention`, sparing any in `referenced`
    pub async fn prune(
        &self,
        retention: TimeDelta,
        referenced: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<PruneReport, AppError> {
        let cutoff = now - retention;
        let mut index = self.index.write().await;

        let stale: Vec<String> = index
            .values()
            .filter(|b| b.created_at < cutoff)
            .map(|b| b.backup_id.clone())
            .collect();

        let mut report = PruneReport { removed: Vec::new(), kept_referenced: 0 };
        for backup_id in stale {
            if referenced.contains(&backup_id) {
                report.kept_referenced += 1;
                continue;
            }
            match tokio::fs::remove_file(self.path_for(&backup_id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            index.remove(&backup_id);
            report.removed.push(backup_id);
        }

        if !report.removed.is_empty() {
            info!("Pruned {} expired backups", report.removed.len());
        }
        Ok(report)
    }
}

async fn read_backup_file(path: &Path) -> Result<BackupFile, AppError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
