use crate::shared::error::ControlPlaneResult;
use crate::shared::types::CellId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Directory of which cell a compute host is mapped into.
#[async_trait]
pub trait HostMappingRepository: Send + Sync {
    /// Cell the host is mapped into, if any.
    async fn get_cell_for_host(&self, host: &str) -> ControlPlaneResult<Option<CellId>>;
}

/// In-memory implementation of the host mapping directory
#[derive(Clone, Default)]
pub struct InMemoryHostMappingRepository {
    mappings: Arc<RwLock<HashMap<String, CellId>>>,
}

impl InMemoryHostMappingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn map_host(&self, host: impl Into<String>, cell: CellId) {
        let mut mappings = self.mappings.write().await;
        mappings.insert(host.into(), cell);
    }

    pub async fn unmap_host(&self, host: &str) -> bool {
        let mut mappings = self.mappings.write().await;
        mappings.remove(host).is_some()
    }
}

#[async_trait]
impl HostMappingRepository for InMemoryHostMappingRepository {
    async fn get_cell_for_host(&self, host: &str) -> ControlPlaneResult<Option<CellId>> {
        let mappings = self.mappings.read().await;
        Ok(mappings.get(host).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_map_and_unmap() {
        let repo = InMemoryHostMappingRepository::new();
        repo.map_host("hostA", CellId::new("cell1")).await;

        assert_eq!(
            repo.get_cell_for_host("hostA").await.unwrap(),
            Some(CellId::new("cell1"))
        );
        assert!(repo.unmap_host("hostA").await);
        assert!(!repo.unmap_host("hostA").await);
        assert_eq!(repo.get_cell_for_host("hostA").await.unwrap(), None);
    }
}
