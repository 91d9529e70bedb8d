//! Published definition storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{MedflowError, StoreError};

use super::model::{DefinitionRef, WorkflowDefinition};
use super::validation::validate;

/// Read/write access to published (frozen) definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Store a frozen definition. Re-storing identical content is a no-op;
    /// different content under an existing id/version is `VersionExists`.
    async fn store(&self, definition: WorkflowDefinition) -> Result<DefinitionRef, StoreError>;

    async fn load(&self, id: &str, version: u32) -> Result<Arc<WorkflowDefinition>, StoreError>;

    /// Highest published version of `id`, if any.
    async fn latest_version(&self, id: &str) -> Result<Option<u32>, StoreError>;
}

/// Validate a definition and freeze it in `store`.
pub async fn publish(
    store: &dyn DefinitionStore,
    definition: WorkflowDefinition,
) -> Result<DefinitionRef, MedflowError> {
    validate(&definition)?;
    let reference = store.store(definition).await?;
    info!(definition = %reference, "Published workflow definition");
    Ok(reference)
}

/// Process-local definition store.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<DefinitionRef, Arc<WorkflowDefinition>>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn store(&self, definition: WorkflowDefinition) -> Result<DefinitionRef, StoreError> {
        let reference = definition.reference();
        let mut definitions = self.definitions.write().await;
        if let Some(existing) = definitions.get(&reference) {
            if **existing == definition {
                return Ok(reference);
            }
            return Err(StoreError::VersionExists {
                definition_id: reference.id,
                version: reference.version,
            });
        }
        definitions.insert(reference.clone(), Arc::new(definition));
        Ok(reference)
    }

    async fn load(&self, id: &str, version: u32) -> Result<Arc<WorkflowDefinition>, StoreError> {
        let key = DefinitionRef {
            id: id.to_string(),
            version,
        };
        self.definitions
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn latest_version(&self, id: &str) -> Result<Option<u32>, StoreError> {
        Ok(self
            .definitions
            .read()
            .await
            .keys()
            .filter(|k| k.id == id)
            .map(|k| k.version)
            .max())
    }
}
