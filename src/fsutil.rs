//! Filesystem helpers
//!
//! Writes go to a temporary sibling first and are renamed over the target,
//! so readers see either the old file or the new one, never a torn write.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Temporary sibling used while writing `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()))
}

/// Stage `bytes` next to `path` and fsync them. The target is untouched.
pub async fn write_temp(path: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(tmp)
}

/// Rename a staged file over the target
pub async fn commit(tmp: &Path, path: &Path) -> std::io::Result<()> {
    if let Err(e) = tokio::fs::rename(tmp, path).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Atomically replace `path` with `bytes`
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = write_temp(path, bytes).await?;
    commit(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uncommitted_write_leaves_target_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("config.json");
        std::fs::write(&target, b"old").unwrap();

        // Abort between staging and rename
        let tmp = write_temp(&target, b"new content").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert_eq!(std::fs::read(&tmp).unwrap(), b"new content");

        commit(&tmp, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new content");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b").join("c.json");
        atomic_write(&target, b"{}").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{}");
    }
}
