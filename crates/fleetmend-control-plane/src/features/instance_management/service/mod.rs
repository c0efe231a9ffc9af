use crate::features::instance_management::repo::InstanceRepository;
use crate::features::observability::service::ObservabilityService;
use crate::shared::config::ControlPlaneConfig;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::fan_out::{apply_failure_policy, scatter_gather};
use crate::shared::types::{CellId, Instance};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Members confirmed live, with the cell each one lives in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveMembership {
    placement: HashMap<String, Option<CellId>>,
}

impl LiveMembership {
    pub fn contains(&self, instance_id: &str) -> bool {
        self.placement.contains_key(instance_id)
    }

    /// Live subset of `members`: unscheduled instances first, then by cell
    /// id, keeping the given order within each cell.
    pub fn ordered(&self, members: &[String]) -> Vec<String> {
        let mut unscheduled = Vec::new();
        let mut by_cell: BTreeMap<&CellId, Vec<String>> = BTreeMap::new();

        for member in members {
            match self.placement.get(member) {
                Some(None) => unscheduled.push(member.clone()),
                Some(Some(cell)) => by_cell.entry(cell).or_default().push(member.clone()),
                None => {}
            }
        }

        unscheduled
            .into_iter()
            .chain(by_cell.into_values().flatten())
            .collect()
    }
}

/// Service for looking up instances across cells
pub struct InstanceService {
    repo: Arc<dyn InstanceRepository>,
    config: Arc<ControlPlaneConfig>,
    observability: Arc<ObservabilityService>,
}

impl InstanceService {
    pub fn new(
        repo: Arc<dyn InstanceRepository>,
        config: Arc<ControlPlaneConfig>,
        observability: Arc<ObservabilityService>,
    ) -> Self {
        Self {
            repo,
            config,
            observability,
        }
    }

    pub async fn get_instance(&self, instance_id: &str) -> ControlPlaneResult<Instance> {
        if instance_id.is_empty() {
            return Err(ControlPlaneError::BadRequest(
                "Instance ID cannot be empty".to_string(),
            ));
        }

        self.repo.get(instance_id).await?.ok_or_else(|| {
            ControlPlaneError::NotFound(format!("Instance {instance_id} could not be found."))
        })
    }

    /// Persist changes to an instance's state or lock fields.
    pub async fn save(&self, instance: Instance) -> ControlPlaneResult<()> {
        debug!(instance_id = %instance.id, vm_state = %instance.vm_state, "Saving instance");
        self.repo.upsert(instance).await
    }

    /// Which of `instance_ids` still exist.
    ///
    /// Ids without any mapping are dropped. Each cell holding at least one of
    /// the ids is queried once for its subset.
    pub async fn resolve_live_members(
        &self,
        instance_ids: &[String],
    ) -> ControlPlaneResult<LiveMembership> {
        if instance_ids.is_empty() {
            return Ok(LiveMembership::default());
        }

        let mappings = self.repo.get_mappings(instance_ids).await?;

        let mut placement = HashMap::new();
        let mut per_cell: BTreeMap<CellId, Vec<String>> = BTreeMap::new();
        for id in instance_ids {
            match mappings.get(id) {
                Some(None) => {
                    placement.insert(id.clone(), None);
                }
                Some(Some(cell)) => per_cell.entry(cell.clone()).or_default().push(id.clone()),
                None => debug!(instance_id = %id, "Dropping member without a cell mapping"),
            }
        }

        let repo = Arc::clone(&self.repo);
        let results = scatter_gather(
            per_cell.keys().cloned().collect::<Vec<_>>(),
            self.config.cell_worker_pool_size,
            |cell| {
                let repo = Arc::clone(&repo);
                let ids = per_cell.get(&cell).cloned().unwrap_or_default();
                async move { repo.list_live_in_cell(&cell, &ids).await }
            },
        )
        .await;

        let (live_by_cell, skipped) =
            apply_failure_policy(results, self.config.partition_failure_policy)?;
        for (cell, _) in &skipped {
            self.observability.record_partition_failure(cell.as_str());
        }

        for (cell, ids) in live_by_cell {
            for id in ids {
                placement.insert(id, Some(cell.clone()));
            }
        }

        Ok(LiveMembership { placement })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::instance_management::repo::InMemoryInstanceRepository;
    use crate::shared::config::PartitionFailurePolicy;
    use crate::shared::types::VmState;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn instance(id: &str, cell: Option<&str>) -> Instance {
        let instance = Instance::new(id, "p1", "u1", None, VmState::Active);
        match cell {
            Some(cell) => instance.in_cell(CellId::new(cell)),
            None => instance,
        }
    }

    fn service(
        repo: InMemoryInstanceRepository,
        policy: PartitionFailurePolicy,
    ) -> InstanceService {
        let config = ControlPlaneConfig {
            partition_failure_policy: policy,
            ..ControlPlaneConfig::default()
        };
        InstanceService::new(
            Arc::new(repo),
            Arc::new(config),
            Arc::new(ObservabilityService::with_new_registry().unwrap()),
        )
    }

    async fn seeded() -> InMemoryInstanceRepository {
        let repo = InMemoryInstanceRepository::new();
        repo.upsert(instance("c2-a", Some("cell2"))).await.unwrap();
        repo.upsert(instance("c1-a", Some("cell1"))).await.unwrap();
        repo.upsert(instance("pending", None)).await.unwrap();
        repo.upsert(instance("c1-b", Some("cell1"))).await.unwrap();
        repo.upsert(instance("gone", Some("cell1"))).await.unwrap();
        repo.mark_deleted("gone").await;
        repo
    }

    #[tokio::test]
    async fn test_get_instance_not_found() {
        let svc = service(InMemoryInstanceRepository::new(), PartitionFailurePolicy::FailClosed);
        let err = svc.get_instance("missing").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_keeps_cell_mapping() {
        let repo = seeded().await;
        let svc = service(repo, PartitionFailurePolicy::FailClosed);

        let mut stored = svc.get_instance("c1-a").await.unwrap();
        stored.vm_state = VmState::Error;
        stored.locked = true;
        svc.save(stored).await.unwrap();

        let reloaded = svc.get_instance("c1-a").await.unwrap();
        assert_eq!(reloaded.vm_state, VmState::Error);
        assert!(reloaded.locked);
        let live = svc.resolve_live_members(&ids(&["c1-a"])).await.unwrap();
        assert!(live.contains("c1-a"));
    }

    #[tokio::test]
    async fn test_live_members_ordered_and_filtered() {
        let repo = seeded().await;
        let handle = repo.clone();
        let svc = service(repo, PartitionFailurePolicy::FailClosed);

        let members = ids(&["c2-a", "c1-b", "gone", "unknown", "pending", "c1-a"]);
        let live = svc.resolve_live_members(&members).await.unwrap();

        assert_eq!(
            live.ordered(&members),
            ids(&["pending", "c1-b", "c1-a", "c2-a"])
        );
        assert!(!live.contains("gone"));
        assert!(!live.contains("unknown"));
        // One query per cell.
        assert_eq!(handle.cell_queries(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_cell_fails_listing() {
        let repo = seeded().await;
        repo.set_unreachable(&CellId::new("cell2"), true).await;
        let svc = service(repo, PartitionFailurePolicy::FailClosed);

        let err = svc
            .resolve_live_members(&ids(&["c1-a", "c2-a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::PartitionUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_cell_dropped_when_degrading() {
        let repo = seeded().await;
        repo.set_unreachable(&CellId::new("cell2"), true).await;
        let svc = service(repo, PartitionFailurePolicy::Degrade);

        let members = ids(&["c1-a", "c2-a"]);
        let live = svc.resolve_live_members(&members).await.unwrap();
        assert_eq!(live.ordered(&members), ids(&["c1-a"]));
    }

    #[tokio::test]
    async fn test_empty_members_query_nothing() {
        let repo = seeded().await;
        let handle = repo.clone();
        let svc = service(repo, PartitionFailurePolicy::FailClosed);

        let live = svc.resolve_live_members(&[]).await.unwrap();
        assert!(live.ordered(&[]).is_empty());
        assert_eq!(handle.cell_queries(), 0);
    }
}
