use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{CellId, CellMapping, ServiceVersion};

/// A service registered in one cell, e.g. a compute node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub host: String,
    pub binary: String,
    pub version: ServiceVersion,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(host: impl Into<String>, binary: impl Into<String>, version: u32) -> Self {
        Self {
            host: host.into(),
            binary: binary.into(),
            version: ServiceVersion(version),
            disabled: false,
            last_seen: Utc::now(),
        }
    }
}

/// Cell directory plus the per-cell service tables.
#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// All cells known to the fleet.
    async fn list_cells(&self) -> ControlPlaneResult<Vec<CellMapping>>;

    /// Services of class `binary` in one cell.
    async fn list_services(
        &self,
        cell: &CellId,
        binary: &str,
    ) -> ControlPlaneResult<Vec<ServiceRecord>>;

    /// Service of class `binary` running on `host` in one cell.
    async fn get_service_by_host(
        &self,
        cell: &CellId,
        host: &str,
        binary: &str,
    ) -> ControlPlaneResult<Option<ServiceRecord>>;
}

/// In-memory implementation of the service repository
#[derive(Clone, Default)]
pub struct InMemoryServiceRepository {
    cells: Arc<RwLock<BTreeMap<CellId, CellMapping>>>,
    services: Arc<RwLock<HashMap<CellId, Vec<ServiceRecord>>>>,
    unreachable: Arc<RwLock<HashSet<CellId>>>,
    cell_queries: Arc<AtomicUsize>,
}

impl InMemoryServiceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_cell(&self, cell: CellMapping) {
        let mut cells = self.cells.write().await;
        cells.insert(cell.id.clone(), cell);
    }

    pub async fn add_service(&self, cell: &CellId, record: ServiceRecord) {
        let mut services = self.services.write().await;
        services.entry(cell.clone()).or_default().push(record);
    }

    /// Make every query against `cell` fail until cleared.
    pub async fn set_unreachable(&self, cell: &CellId, unreachable: bool) {
        let mut cells = self.unreachable.write().await;
        if unreachable {
            cells.insert(cell.clone());
        } else {
            cells.remove(cell);
        }
    }

    /// Number of per-cell queries served so far.
    pub fn cell_queries(&self) -> usize {
        self.cell_queries.load(Ordering::SeqCst)
    }

    async fn check_reachable(&self, cell: &CellId) -> ControlPlaneResult<()> {
        self.cell_queries.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.read().await.contains(cell) {
            return Err(ControlPlaneError::PartitionUnavailable {
                cell: cell.clone(),
                reason: "cell database did not respond".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRepository for InMemoryServiceRepository {
    async fn list_cells(&self) -> ControlPlaneResult<Vec<CellMapping>> {
        let cells = self.cells.read().await;
        Ok(cells.values().cloned().collect())
    }

    async fn list_services(
        &self,
        cell: &CellId,
        binary: &str,
    ) -> ControlPlaneResult<Vec<ServiceRecord>> {
        self.check_reachable(cell).await?;
        let services = self.services.read().await;
        Ok(services
            .get(cell)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.binary == binary)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_service_by_host(
        &self,
        cell: &CellId,
        host: &str,
        binary: &str,
    ) -> ControlPlaneResult<Option<ServiceRecord>> {
        self.check_reachable(cell).await?;
        let services = self.services.read().await;
        Ok(services.get(cell).and_then(|records| {
            records
                .iter()
                .find(|record| record.host == host && record.binary == binary)
                .cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_services_filters_by_binary() {
        let repo = InMemoryServiceRepository::new();
        let cell = CellId::new("cell1");
        repo.add_cell(CellMapping::new("cell1", "cell one")).await;
        repo.add_service(&cell, ServiceRecord::new("hostA", "compute-node", 62))
            .await;
        repo.add_service(&cell, ServiceRecord::new("hostA", "scheduler", 70))
            .await;

        let services = repo.list_services(&cell, "compute-node").await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].version, ServiceVersion(62));
    }

    #[tokio::test]
    async fn test_cells_listed_in_id_order() {
        let repo = InMemoryServiceRepository::new();
        repo.add_cell(CellMapping::new("cell2", "two")).await;
        repo.add_cell(CellMapping::new("cell1", "one")).await;

        let cells = repo.list_cells().await.unwrap();
        assert_eq!(cells[0].id, CellId::new("cell1"));
        assert_eq!(cells[1].id, CellId::new("cell2"));
    }

    #[tokio::test]
    async fn test_unreachable_cell_fails_queries() {
        let repo = InMemoryServiceRepository::new();
        let cell = CellId::new("cell1");
        repo.set_unreachable(&cell, true).await;

        let result = repo.list_services(&cell, "compute-node").await;
        assert!(matches!(
            result,
            Err(ControlPlaneError::PartitionUnavailable { .. })
        ));

        repo.set_unreachable(&cell, false).await;
        assert!(repo.list_services(&cell, "compute-node").await.is_ok());
        assert_eq!(repo.cell_queries(), 2);
    }

    #[tokio::test]
    async fn test_get_service_by_host() {
        let repo = InMemoryServiceRepository::new();
        let cell = CellId::new("cell1");
        repo.add_service(&cell, ServiceRecord::new("hostB", "compute-node", 66))
            .await;

        let found = repo
            .get_service_by_host(&cell, "hostB", "compute-node")
            .await
            .unwrap();
        assert!(found.is_some());
        let missing = repo
            .get_service_by_host(&cell, "hostC", "compute-node")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
