use crate::shared::error::ControlPlaneResult;
use crate::shared::types::ServerGroup;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Repository trait for server group storage
#[async_trait]
pub trait ServerGroupRepository: Send + Sync {
    async fn get(&self, group_id: &str) -> ControlPlaneResult<Option<ServerGroup>>;

    async fn list_by_project(&self, project_id: &str) -> ControlPlaneResult<Vec<ServerGroup>>;

    async fn list_all(&self) -> ControlPlaneResult<Vec<ServerGroup>>;

    async fn create(&self, group: ServerGroup) -> ControlPlaneResult<()>;

    /// Returns false when the group was already gone.
    async fn delete(&self, group_id: &str) -> ControlPlaneResult<bool>;

    async fn count_by_project(&self, project_id: &str) -> ControlPlaneResult<usize>;
}

/// In-memory implementation of server group repository
#[derive(Clone, Default)]
pub struct InMemoryServerGroupRepository {
    storage: Arc<RwLock<HashMap<String, ServerGroup>>>,
}

impl InMemoryServerGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerGroupRepository for InMemoryServerGroupRepository {
    async fn get(&self, group_id: &str) -> ControlPlaneResult<Option<ServerGroup>> {
        let storage = self.storage.read().await;
        Ok(storage.get(group_id).cloned())
    }

    async fn list_by_project(&self, project_id: &str) -> ControlPlaneResult<Vec<ServerGroup>> {
        let storage = self.storage.read().await;
        Ok(storage
            .values()
            .filter(|group| group.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> ControlPlaneResult<Vec<ServerGroup>> {
        let storage = self.storage.read().await;
        Ok(storage.values().cloned().collect())
    }

    async fn create(&self, group: ServerGroup) -> ControlPlaneResult<()> {
        let mut storage = self.storage.write().await;
        storage.insert(group.id.clone(), group);
        Ok(())
    }

    async fn delete(&self, group_id: &str) -> ControlPlaneResult<bool> {
        let mut storage = self.storage.write().await;
        Ok(storage.remove(group_id).is_some())
    }

    async fn count_by_project(&self, project_id: &str) -> ControlPlaneResult<usize> {
        let storage = self.storage.read().await;
        Ok(storage
            .values()
            .filter(|group| group.project_id == project_id)
            .count())
    }
}
