//! Definition snapshots served from stored workflow versions

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::collaborators::DefinitionStore;
use crate::definition::{DefinitionError, WorkflowDefinition};
use crate::model::{VersionStatus, WorkflowVersion};
use crate::persistence::{StoreError, VersionRepository};

/// [`DefinitionStore`] over the version repository
///
/// Published snapshots are immutable, so pinned lookups are cached for the
/// life of the process. Current-version lookups always go to the store.
pub struct VersionDefinitionStore {
    versions: Arc<dyn VersionRepository>,
    cache: DashMap<(Uuid, u32), Arc<WorkflowDefinition>>,
}

impl VersionDefinitionStore {
    pub fn new(versions: Arc<dyn VersionRepository>) -> Self {
        Self {
            versions,
            cache: DashMap::new(),
        }
    }

    fn snapshot(&self, version: WorkflowVersion) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let key = (version.workflow_id, version.version_number);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let mut definition = version.definition;
        definition.version = version.version_number;
        definition.validate()?;

        let definition = Arc::new(definition);
        // drafts may still change
        if version.status != VersionStatus::Draft {
            self.cache.insert(key, definition.clone());
        }
        Ok(definition)
    }
}

fn lookup_error(workflow_id: Uuid, version: Option<u32>, err: StoreError) -> DefinitionError {
    match err {
        StoreError::VersionNotFound { .. } => DefinitionError::NotFound { workflow_id, version },
        other => DefinitionError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl DefinitionStore for VersionDefinitionStore {
    async fn get(&self, workflow_id: Uuid, version: u32) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        if let Some(cached) = self.cache.get(&(workflow_id, version)) {
            return Ok(cached.clone());
        }
        let stored = self
            .versions
            .get_version_by_number(workflow_id, version)
            .await
            .map_err(|e| lookup_error(workflow_id, Some(version), e))?;
        self.snapshot(stored)
    }

    async fn current(&self, workflow_id: Uuid) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let current = self
            .versions
            .current_version(workflow_id)
            .await
            .map_err(|e| lookup_error(workflow_id, None, e))?
            .ok_or(DefinitionError::NotFound {
                workflow_id,
                version: None,
            })?;
        self.snapshot(current)
    }

    async fn list_triggered(
        &self,
        account_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<Arc<WorkflowDefinition>>, DefinitionError> {
        let current = self
            .versions
            .list_current_versions(account_id)
            .await
            .map_err(|e| DefinitionError::Unavailable(e.to_string()))?;

        let mut triggered = Vec::new();
        for version in current {
            if version.status != VersionStatus::Active {
                continue;
            }
            let listens = version
                .definition
                .trigger
                .as_ref()
                .is_some_and(|t| t.is_active && t.event_type == event_type);
            if listens {
                triggered.push(self.snapshot(version)?);
            }
        }
        Ok(triggered)
    }

    async fn is_workflow_active(&self, workflow_id: Uuid) -> Result<bool, DefinitionError> {
        let current = self
            .versions
            .current_version(workflow_id)
            .await
            .map_err(|e| DefinitionError::Unavailable(e.to_string()))?;
        Ok(current.is_some_and(|v| v.status == VersionStatus::Active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Node, NodeKind, TriggerConfig};
    use crate::persistence::InMemoryEngineStore;
    use chrono::Utc;

    fn definition(workflow_id: Uuid, account_id: Uuid) -> WorkflowDefinition {
        WorkflowDefinition::new(workflow_id, account_id, 1)
            .with_trigger(TriggerConfig::new("tag_added"))
            .with_node(Node {
                id: "exit".into(),
                name: None,
                kind: NodeKind::Exit,
                next: None,
            })
    }

    #[tokio::test]
    async fn test_current_and_pinned_lookups() {
        let store = Arc::new(InMemoryEngineStore::new());
        let definitions = VersionDefinitionStore::new(store.clone());
        let workflow_id = Uuid::now_v7();
        let account_id = Uuid::now_v7();

        assert!(!definitions.is_workflow_active(workflow_id).await.unwrap());
        assert!(matches!(
            definitions.current(workflow_id).await,
            Err(DefinitionError::NotFound { .. })
        ));

        let version = WorkflowVersion::draft(definition(workflow_id, account_id), None);
        store.insert_version(&version).await.unwrap();
        store.publish_version(version.id, None, Utc::now()).await.unwrap();

        assert!(definitions.is_workflow_active(workflow_id).await.unwrap());
        assert_eq!(definitions.current(workflow_id).await.unwrap().version, 1);
        assert_eq!(definitions.get(workflow_id, 1).await.unwrap().workflow_id, workflow_id);
        assert_eq!(definitions.list_triggered(account_id, "tag_added").await.unwrap().len(), 1);
        assert!(definitions.list_triggered(account_id, "purchase").await.unwrap().is_empty());

        store.deactivate_workflow(workflow_id, Utc::now()).await.unwrap();
        assert!(!definitions.is_workflow_active(workflow_id).await.unwrap());
        // pinned snapshots stay readable for executions already running
        assert!(definitions.get(workflow_id, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_version() {
        let store = Arc::new(InMemoryEngineStore::new());
        let definitions = VersionDefinitionStore::new(store);

        let err = definitions.get(Uuid::now_v7(), 3).await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound { .. }));
    }
}
