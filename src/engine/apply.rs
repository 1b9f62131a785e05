//! Apply engine
//!
//! Backup, validate, then atomically write. Writes and restores to the same
//! resource are serialized by a per-resource lock; different resources run
//! concurrently. Callers take the lock with [`ApplyEngine::lock_resource`] and
//! may hold it across several steps.

use crate::backup::BackupStore;
use crate::engine::update::{ConfigUpdate, UpdateState};
use crate::engine::validation::ConfigValidator;
use crate::error::{validation_error, AppError};
use crate::fsutil::atomic_write;
use crate::proposal::apply_change_set;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Exclusive hold on one resource
pub struct ResourceGuard {
    resource: String,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    fn check(&self, resource: &str) -> Result<(), AppError> {
        if self.resource != resource {
            return Err(AppError::Internal(format!(
                "Lock for {} used to modify {}",
                self.resource, resource
            )));
        }
        Ok(())
    }
}

pub struct ApplyEngine {
    config_root: PathBuf,
    backups: Arc<BackupStore>,
    validator: ConfigValidator,
    require_validation: bool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    writes: AtomicU64,
}

impl ApplyEngine {
    pub fn new(
        config_root: impl Into<PathBuf>,
        backups: Arc<BackupStore>,
        validator: ConfigValidator,
        require_validation: bool,
    ) -> Self {
        Self {
            config_root: config_root.into(),
            backups,
            validator,
            require_validation,
            locks: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Map a resource name to a path under the config root
    pub fn resolve(&self, resource: &str) -> Result<PathBuf, AppError> {
        let relative = Path::new(resource);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if resource.trim().is_empty() || escapes {
            return Err(validation_error(format!(
                "Resource '{}' must be a relative path inside the config root",
                resource
            )));
        }
        Ok(self.config_root.join(relative))
    }

    /// Wait for exclusive use of `resource`
    pub async fn lock_resource(&self, resource: &str) -> ResourceGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        ResourceGuard {
            resource: resource.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Run backup, validation and the atomic write for `update`.
    ///
    /// On error the caller marks the update Failed; the resource is untouched.
    /// A successful write is stamped with the next write sequence number.
    pub async fn execute(
        &self,
        guard: &ResourceGuard,
        update: &mut ConfigUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        guard.check(&update.target_resource)?;
        let path = self.resolve(&update.target_resource)?;

        // 1. Backup
        let original = tokio::fs::read(&path).await.map_err(|e| {
            AppError::Apply(format!("Cannot read {}: {}", update.target_resource, e))
        })?;
        let backup = self
            .backups
            .create(&update.target_resource, &original, &update.change_set, update.update_id, now)
            .await
            .map_err(|e| AppError::Apply(format!("Backup failed: {}", e)))?;
        update.backup_id = Some(backup.backup_id.clone());
        update.transition(UpdateState::Validating)?;

        // 2. Validate against the document the change would produce
        let current: serde_json::Value = serde_json::from_slice(&original).map_err(|e| {
            AppError::Apply(format!("{} is not valid JSON: {}", update.target_resource, e))
        })?;
        let proposed = apply_change_set(&current, &update.change_set)?;
        if self.require_validation {
            if !self.validator.has_schema(&update.target_resource) {
                debug!("No declared schema for {}, checking structure only", update.target_resource);
            }
            self.validator.validate(&update.target_resource, &proposed)?;
        } else {
            debug!("Validation disabled, skipping checks for {}", update.target_resource);
        }
        update.transition(UpdateState::Applying)?;

        // 3. Atomic write
        let mut bytes = serde_json::to_vec_pretty(&proposed)?;
        bytes.push(b'\n');
        atomic_write(&path, &bytes).await.map_err(|e| {
            AppError::Apply(format!("Write to {} failed: {}", update.target_resource, e))
        })?;

        // 4. Start the rollback clock
        update.write_sequence = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        update.mark_applied(now)?;
        info!(
            "Applied update {} to {} (backup {})",
            update.update_id, update.target_resource, backup.backup_id
        );
        Ok(())
    }

    /// Restore the backup taken for `update`, verifying its checksum first
    pub async fn restore(&self, guard: &ResourceGuard, update: &ConfigUpdate) -> Result<(), AppError> {
        guard
            .check(&update.target_resource)
            .map_err(|e| AppError::Rollback(e.to_string()))?;
        let backup_id = update.backup_id.as_deref().ok_or_else(|| {
            AppError::Rollback(format!("Update {} has no backup", update.update_id))
        })?;
        let path = self
            .resolve(&update.target_resource)
            .map_err(|e| AppError::Rollback(e.to_string()))?;

        let bytes = self.backups.restore_bytes(backup_id).await?;
        atomic_write(&path, &bytes).await.map_err(|e| {
            AppError::Rollback(format!("Restore of {} failed: {}", update.target_resource, e))
        })?;
        info!(
            "Restored {} from backup {} for update {}",
            update.target_resource, backup_id, update.update_id
        );
        Ok(())
    }
}
