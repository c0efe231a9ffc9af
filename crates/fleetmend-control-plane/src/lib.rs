pub mod features;
pub mod seed;
pub mod server;
pub mod shared;

use crate::features::host_resolution::repo::HostMappingRepository;
use crate::features::host_resolution::service::HostResolver;
use crate::features::instance_management::repo::InstanceRepository;
use crate::features::instance_management::service::InstanceService;
use crate::features::observability::controller::ObservabilityController;
use crate::features::relocation::controller::RelocationController;
use crate::features::relocation::repo::ComputeApi;
use crate::features::relocation::service::RelocationCoordinator;
use crate::features::security_groups::controller::SecurityGroupController;
use crate::features::security_groups::repo::SecurityGroupRepository;
use crate::features::security_groups::service::SecurityGroupService;
use crate::features::server_actions::controller::ServerActionController;
use crate::features::server_actions::service::ServerActionService;
use crate::features::server_groups::controller::ServerGroupController;
use crate::features::server_groups::repo::ServerGroupRepository;
use crate::features::server_groups::service::ServerGroupService;
use crate::features::version_registry::repo::ServiceRepository;
use crate::features::version_registry::service::FleetVersionService;
use crate::shared::config::ControlPlaneConfig;
use std::sync::Arc;

/// Storage and compute collaborators the control plane runs against.
pub struct Backends {
    pub services: Arc<dyn ServiceRepository>,
    pub host_mappings: Arc<dyn HostMappingRepository>,
    pub instances: Arc<dyn InstanceRepository>,
    pub server_groups: Arc<dyn ServerGroupRepository>,
    pub security_groups: Arc<dyn SecurityGroupRepository>,
    pub compute: Arc<dyn ComputeApi>,
}

/// Controllers wired to one configuration and one set of backends.
pub struct ControlPlane {
    pub config: Arc<ControlPlaneConfig>,
    pub observability: Arc<ObservabilityController>,
    pub server_actions: Arc<ServerActionController>,
    pub server_groups: Arc<ServerGroupController>,
    pub security_groups: Arc<SecurityGroupController>,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig, backends: Backends) -> Result<Self, String> {
        config.validate().map_err(|e| e.to_string())?;
        let config = Arc::new(config);

        let observability = ObservabilityController::with_new_registry()?;
        let metrics = observability.service();

        let instances = Arc::new(InstanceService::new(
            backends.instances,
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        let versions = Arc::new(FleetVersionService::new(
            Arc::clone(&backends.services),
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        let hosts = Arc::new(HostResolver::new(
            backends.host_mappings,
            backends.services,
        ));

        let coordinator = Arc::new(RelocationCoordinator::new(
            Arc::clone(&instances),
            Arc::clone(&versions),
            hosts,
            Arc::clone(&backends.compute),
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        let server_group_service = Arc::new(ServerGroupService::new(
            backends.server_groups,
            Arc::clone(&instances),
            versions,
            Arc::clone(&config),
        ));
        let security_group_service = Arc::new(SecurityGroupService::new(
            backends.security_groups,
            Arc::clone(&instances),
            Arc::clone(&config),
            metrics,
        ));
        let server_action_service =
            Arc::new(ServerActionService::new(instances, backends.compute));

        Ok(Self {
            server_actions: Arc::new(ServerActionController::new(
                Arc::new(RelocationController::new(coordinator)),
                server_action_service,
                Arc::clone(&security_group_service),
            )),
            server_groups: Arc::new(ServerGroupController::new(
                server_group_service,
                Arc::clone(&config),
            )),
            security_groups: Arc::new(SecurityGroupController::new(
                security_group_service,
                Arc::clone(&config),
            )),
            observability,
            config,
        })
    }
}
