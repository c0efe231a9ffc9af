use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{CellId, Instance, VmState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Repository trait for instance records and the instance-to-cell index
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Retrieve an instance by ID
    async fn get(&self, instance_id: &str) -> ControlPlaneResult<Option<Instance>>;

    /// Cell mapping for each known id. `Some(None)` means the instance exists
    /// but has not been scheduled into a cell yet; unknown ids are left out.
    async fn get_mappings(
        &self,
        instance_ids: &[String],
    ) -> ControlPlaneResult<HashMap<String, Option<CellId>>>;

    /// Ids among `instance_ids` that are stored in `cell` and not deleted.
    async fn list_live_in_cell(
        &self,
        cell: &CellId,
        instance_ids: &[String],
    ) -> ControlPlaneResult<Vec<String>>;

    /// Store or replace an instance and its mapping
    async fn upsert(&self, instance: Instance) -> ControlPlaneResult<()>;
}

/// In-memory implementation of instance repository
#[derive(Clone, Default)]
pub struct InMemoryInstanceRepository {
    instances: Arc<RwLock<HashMap<String, Instance>>>,
    mappings: Arc<RwLock<HashMap<String, Option<CellId>>>>,
    unreachable: Arc<RwLock<HashSet<CellId>>>,
    cell_queries: Arc<AtomicUsize>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the mapping but keep the record, as after a half-finished delete.
    pub async fn remove_mapping(&self, instance_id: &str) {
        let mut mappings = self.mappings.write().await;
        mappings.remove(instance_id);
    }

    pub async fn mark_deleted(&self, instance_id: &str) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get_mut(instance_id) {
            Some(instance) => {
                instance.vm_state = VmState::Deleted;
                true
            }
            None => false,
        }
    }

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
impl InstanceRepository for InMemoryInstanceRepository {
    async fn get(&self, instance_id: &str) -> ControlPlaneResult<Option<Instance>> {
        let cell = {
            let mappings = self.mappings.read().await;
            match mappings.get(instance_id) {
                Some(cell) => cell.clone(),
                None => return Ok(None),
            }
        };
        if let Some(cell) = &cell {
            self.check_reachable(cell).await?;
        }

        let instances = self.instances.read().await;
        Ok(instances
            .get(instance_id)
            .filter(|instance| instance.vm_state != VmState::Deleted)
            .cloned())
    }

    async fn get_mappings(
        &self,
        instance_ids: &[String],
    ) -> ControlPlaneResult<HashMap<String, Option<CellId>>> {
        let mappings = self.mappings.read().await;
        Ok(instance_ids
            .iter()
            .filter_map(|id| mappings.get(id).map(|cell| (id.clone(), cell.clone())))
            .collect())
    }

    async fn list_live_in_cell(
        &self,
        cell: &CellId,
        instance_ids: &[String],
    ) -> ControlPlaneResult<Vec<String>> {
        self.check_reachable(cell).await?;
        let instances = self.instances.read().await;
        Ok(instance_ids
            .iter()
            .filter(|id| {
                instances.get(*id).is_some_and(|instance| {
                    instance.cell_id.as_ref() == Some(cell)
                        && instance.vm_state != VmState::Deleted
                })
            })
            .cloned()
            .collect())
    }

    async fn upsert(&self, instance: Instance) -> ControlPlaneResult<()> {
        let mut mappings = self.mappings.write().await;
        let mut instances = self.instances.write().await;
        mappings.insert(instance.id.clone(), instance.cell_id.clone());
        instances.insert(instance.id.clone(), instance);
        Ok(())
    }
}
