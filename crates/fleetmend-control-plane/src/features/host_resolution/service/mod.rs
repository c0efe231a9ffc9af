use crate::features::host_resolution::repo::HostMappingRepository;
use crate::features::version_registry::repo::ServiceRepository;
use crate::shared::error::ControlPlaneError;
use crate::shared::types::{CellId, COMPUTE_SERVICE};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A compute host that is registered and mapped into a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRef {
    pub host: String,
    pub cell_id: CellId,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostLookupError {
    /// No cell has this host in its mapping table.
    #[error("Compute host {0} is not mapped to any cell")]
    NotMapped(String),
    /// The host is mapped but its cell has no compute service for it.
    #[error("Compute host {host} has no compute service in cell {cell}")]
    NotFound { host: String, cell: CellId },
    #[error(transparent)]
    Storage(#[from] ControlPlaneError),
}

/// Callers see both lookup misses the same way.
impl From<HostLookupError> for ControlPlaneError {
    fn from(err: HostLookupError) -> Self {
        match err {
            HostLookupError::NotMapped(host) | HostLookupError::NotFound { host, .. } => {
                ControlPlaneError::NotFound(format!("Compute host {host} not found."))
            }
            HostLookupError::Storage(inner) => inner,
        }
    }
}

pub struct HostResolver {
    mappings: Arc<dyn HostMappingRepository>,
    services: Arc<dyn ServiceRepository>,
}

impl HostResolver {
    pub fn new(
        mappings: Arc<dyn HostMappingRepository>,
        services: Arc<dyn ServiceRepository>,
    ) -> Self {
        Self { mappings, services }
    }

    pub async fn resolve(&self, host: &str) -> Result<HostRef, HostLookupError> {
        let Some(cell_id) = self.mappings.get_cell_for_host(host).await? else {
            warn!(host, "Target host is not mapped to a cell");
            return Err(HostLookupError::NotMapped(host.to_string()));
        };

        let Some(service) = self
            .services
            .get_service_by_host(&cell_id, host, COMPUTE_SERVICE)
            .await?
        else {
            warn!(host, cell = %cell_id, "Target host is mapped but has no compute service");
            return Err(HostLookupError::NotFound {
                host: host.to_string(),
                cell: cell_id,
            });
        };

        debug!(host, cell = %cell_id, "Resolved target host");
        Ok(HostRef {
            host: service.host,
            cell_id,
            disabled: service.disabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::host_resolution::repo::InMemoryHostMappingRepository;
    use crate::features::version_registry::repo::{InMemoryServiceRepository, ServiceRecord};

    async fn resolver() -> (HostResolver, InMemoryServiceRepository) {
        let mappings = InMemoryHostMappingRepository::new();
        let services = InMemoryServiceRepository::new();
        let cell = CellId::new("cell1");

        mappings.map_host("hostB", cell.clone()).await;
        mappings.map_host("hostGhost", cell.clone()).await;
        services
            .add_service(&cell, ServiceRecord::new("hostB", COMPUTE_SERVICE, 66))
            .await;

        (
            HostResolver::new(Arc::new(mappings), Arc::new(services.clone())),
            services,
        )
    }

    #[tokio::test]
    async fn test_resolve_known_host() {
        let (resolver, _) = resolver().await;
        let host = resolver.resolve("hostB").await.unwrap();
        assert_eq!(host.host, "hostB");
        assert_eq!(host.cell_id, CellId::new("cell1"));
        assert!(!host.disabled);
    }

    #[tokio::test]
    async fn test_disabled_service_is_reported() {
        let mappings = InMemoryHostMappingRepository::new();
        let services = InMemoryServiceRepository::new();
        let cell = CellId::new("cell1");
        mappings.map_host("hostC", cell.clone()).await;
        let mut record = ServiceRecord::new("hostC", COMPUTE_SERVICE, 66);
        record.disabled = true;
        services.add_service(&cell, record).await;
        let resolver = HostResolver::new(Arc::new(mappings), Arc::new(services));

        let host = resolver.resolve("hostC").await.unwrap();
        assert!(host.disabled);
    }

    #[tokio::test]
    async fn test_unmapped_and_missing_are_distinct() {
        let (resolver, _) = resolver().await;

        let unmapped = resolver.resolve("hostZ").await.unwrap_err();
        assert!(matches!(unmapped, HostLookupError::NotMapped(_)));

        let missing = resolver.resolve("hostGhost").await.unwrap_err();
        assert!(matches!(missing, HostLookupError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_lookup_misses_map_to_not_found() {
        let (resolver, _) = resolver().await;
        let err: ControlPlaneError = resolver.resolve("hostZ").await.unwrap_err().into();
        assert_eq!(
            err,
            ControlPlaneError::NotFound("Compute host hostZ not found.".to_string())
        );
    }

    #[tokio::test]
    async fn test_unreachable_cell_is_a_storage_error() {
        let (resolver, services) = resolver().await;
        services.set_unreachable(&CellId::new("cell1"), true).await;

        let err = resolver.resolve("hostB").await.unwrap_err();
        assert!(matches!(
            err,
            HostLookupError::Storage(ControlPlaneError::PartitionUnavailable { .. })
        ));
    }
}
