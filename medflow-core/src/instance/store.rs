//! Instance persistence with optimistic concurrency.
//!
//! Every stored instance carries a revision. `save` succeeds only when the
//! caller's copy was loaded at the current revision; otherwise it fails with
//! [`StoreError::StaleWrite`] and the caller must reload and retry.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::persistence::{read_json, write_json_atomic};

use super::model::WorkflowInstance;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Persist a new instance at revision 0.
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Replace the stored instance if `instance.revision` is current.
    /// Returns the new revision.
    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, StoreError>;

    /// IDs of every stored instance.
    async fn list(&self) -> Result<Vec<Uuid>, StoreError>;
}

fn check_revision(instance: &WorkflowInstance, stored: u64) -> Result<u64, StoreError> {
    if instance.revision != stored {
        return Err(StoreError::StaleWrite {
            instance_id: instance.id,
            expected: instance.revision,
            actual: stored,
        });
    }
    Ok(stored + 1)
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists {
                key: instance.id.to_string(),
            });
        }
        let mut stored = instance.clone();
        stored.revision = 0;
        instances.insert(instance.id, stored);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: id.to_string() })
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, StoreError> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get(&instance.id)
            .ok_or_else(|| StoreError::NotFound {
                key: instance.id.to_string(),
            })?;
        let next = check_revision(instance, stored.revision)?;
        let mut updated = instance.clone();
        updated.revision = next;
        instances.insert(instance.id, updated);
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.instances.read().await.keys().copied().collect())
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// One JSON file per instance under a directory.
///
/// Revision checks are serialized within this process. Two processes
/// sharing a directory are not coordinated.
pub struct FileInstanceStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileInstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(read_json(&self.path_for(id)).await?)
    }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.read(instance.id).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                key: instance.id.to_string(),
            });
        }
        let mut stored = instance.clone();
        stored.revision = 0;
        write_json_atomic(&self.path_for(instance.id), &stored).await?;
        debug!(instance_id = %instance.id, "Stored new instance");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.read(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { key: id.to_string() })
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = self
            .read(instance.id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                key: instance.id.to_string(),
            })?;
        let next = check_revision(instance, stored.revision)?;
        let mut updated = instance.clone();
        updated.revision = next;
        write_json_atomic(&self.path_for(instance.id), &updated).await?;
        debug!(instance_id = %instance.id, revision = next, "Saved instance");
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
