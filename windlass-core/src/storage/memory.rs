//! In-memory snapshot store for tests and ephemeral deployments

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{ContextSnapshot, SnapshotStore};
use crate::error::{Result, WindlassError};

/// Snapshots held in a process-local map; lost on exit
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, ContextSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> WindlassError {
        WindlassError::Storage("snapshot map lock poisoned".to_string())
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<ContextSnapshot>> {
        let snapshots = self.snapshots.read().map_err(|_| Self::poisoned())?;
        Ok(snapshots.get(key).cloned())
    }

    async fn save(&self, key: &str, snapshot: &ContextSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().map_err(|_| Self::poisoned())?;
        snapshots.insert(key.to_string(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut snapshots = self.snapshots.write().map_err(|_| Self::poisoned())?;
        Ok(snapshots.remove(key).is_some())
    }
}
