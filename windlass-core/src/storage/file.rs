//! One JSON file per session

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{ContextSnapshot, SnapshotStore};
use crate::error::{Result, WindlassError};

/// Snapshot store writing `<dir>/<session>.json`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a session key. The key is percent-encoded, so a `/` or
    /// `\` in it never reaches the filesystem as a separator.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }

    fn storage_error(action: &str, path: &Path, e: std::io::Error) -> WindlassError {
        WindlassError::Storage(format!("failed to {} {}: {}", action, path.display(), e))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<ContextSnapshot>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::storage_error("read", &path, e)),
        };

        let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            WindlassError::Storage(format!("corrupt snapshot {}: {}", path.display(), e))
        })?;
        Ok(Some(snapshot))
    }

    async fn save(&self, key: &str, snapshot: &ContextSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::storage_error("create", &self.dir, e))?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Self::storage_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::storage_error("rename", &path, e))?;

        tracing::debug!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "snapshot written"
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::storage_error("delete", &path, e)),
        }
    }
}
