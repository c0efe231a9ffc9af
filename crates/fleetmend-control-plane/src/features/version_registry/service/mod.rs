use crate::features::observability::service::ObservabilityService;
use crate::features::version_registry::repo::ServiceRepository;
use crate::shared::config::ControlPlaneConfig;
use crate::shared::error::ControlPlaneResult;
use crate::shared::fan_out::{apply_failure_policy, scatter_gather};
use crate::shared::types::{MinimumVersion, ServiceVersion};
use std::sync::Arc;
use tracing::{debug, info};

/// Fleet-wide view of the service versions reported by every cell.
pub struct FleetVersionService {
    repo: Arc<dyn ServiceRepository>,
    config: Arc<ControlPlaneConfig>,
    observability: Arc<ObservabilityService>,
}

impl FleetVersionService {
    pub fn new(
        repo: Arc<dyn ServiceRepository>,
        config: Arc<ControlPlaneConfig>,
        observability: Arc<ObservabilityService>,
    ) -> Self {
        Self {
            repo,
            config,
            observability,
        }
    }

    /// Lowest version reported by any service of class `binary`.
    ///
    /// Every call queries the cells again; the result is never cached.
    pub async fn get_minimum_version(&self, binary: &str) -> ControlPlaneResult<MinimumVersion> {
        let cells = self.repo.list_cells().await?;
        let repo = Arc::clone(&self.repo);
        let binary_owned = binary.to_string();

        let results = scatter_gather(
            cells.into_iter().map(|cell| cell.id),
            self.config.cell_worker_pool_size,
            move |cell| {
                let repo = Arc::clone(&repo);
                let binary = binary_owned.clone();
                async move {
                    let services = repo.list_services(&cell, &binary).await?;
                    Ok(services
                        .into_iter()
                        .map(|service| service.version)
                        .collect::<Vec<ServiceVersion>>())
                }
            },
        )
        .await;

        let (per_cell, skipped) =
            apply_failure_policy(results, self.config.partition_failure_policy)?;
        for (cell, _) in &skipped {
            self.observability.record_partition_failure(cell.as_str());
        }

        for (cell, versions) in &per_cell {
            debug!(cell = %cell, reports = versions.len(), binary, "Collected service versions");
        }

        let minimum = MinimumVersion::from_reports(per_cell.into_values().flatten());
        info!(binary, minimum = %minimum, skipped_cells = skipped.len(), "Computed fleet minimum version");
        Ok(minimum)
    }
}
