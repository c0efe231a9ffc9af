use crate::features::host_resolution::service::HostResolver;
use crate::features::instance_management::service::InstanceService;
use crate::features::observability::service::ObservabilityService;
use crate::features::relocation::repo::ComputeApi;
use crate::features::version_registry::service::FleetVersionService;
use crate::shared::config::ControlPlaneConfig;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{
    CredentialMode, Instance, RelocateResponse, RelocationDispatch, RelocationRequest,
    ServiceVersion, VmState, COMPUTE_SERVICE,
};
use fleetmend_core::credential::generate_password;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum compute service version able to leave an evacuated instance stopped.
pub const STOPPED_TARGET_MIN_COMPUTE_VERSION: ServiceVersion = ServiceVersion::new(62);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationPhase {
    Validating,
    CredentialResolved,
    Dispatched,
    Accepted,
    Rejected,
}

impl fmt::Display for RelocationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelocationPhase::Validating => "validating",
            RelocationPhase::CredentialResolved => "credential_resolved",
            RelocationPhase::Dispatched => "dispatched",
            RelocationPhase::Accepted => "accepted",
            RelocationPhase::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Phase tracking for one relocation request.
struct RelocationAttempt<'a> {
    instance_id: &'a str,
    phase: RelocationPhase,
}

impl<'a> RelocationAttempt<'a> {
    fn start(instance_id: &'a str) -> Self {
        debug!(instance_id, phase = %RelocationPhase::Validating, "Relocation started");
        Self {
            instance_id,
            phase: RelocationPhase::Validating,
        }
    }

    fn advance(&mut self, next: RelocationPhase) {
        debug!(
            instance_id = self.instance_id,
            from = %self.phase,
            to = %next,
            "Relocation phase change"
        );
        self.phase = next;
    }
}

/// Post-relocation admin credential and whether the caller gets to see it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedCredential {
    credential: Option<String>,
    on_shared_storage: Option<bool>,
    echo: bool,
}

/// Evacuates instances off failed hosts.
pub struct RelocationCoordinator {
    instances: Arc<InstanceService>,
    versions: Arc<FleetVersionService>,
    hosts: Arc<HostResolver>,
    compute: Arc<dyn ComputeApi>,
    config: Arc<ControlPlaneConfig>,
    observability: Arc<ObservabilityService>,
}

impl RelocationCoordinator {
    pub fn new(
        instances: Arc<InstanceService>,
        versions: Arc<FleetVersionService>,
        hosts: Arc<HostResolver>,
        compute: Arc<dyn ComputeApi>,
        config: Arc<ControlPlaneConfig>,
        observability: Arc<ObservabilityService>,
    ) -> Self {
        Self {
            instances,
            versions,
            hosts,
            compute,
            config,
            observability,
        }
    }

    /// Validate and dispatch one relocation.
    ///
    /// Returns the body to send back, which is only present in legacy
    /// credential mode with instance passwords enabled.
    pub async fn relocate(
        &self,
        request: RelocationRequest,
    ) -> ControlPlaneResult<Option<RelocateResponse>> {
        let mut attempt = RelocationAttempt::start(&request.instance_id);

        let instance = match self.validate(&request).await {
            Ok(instance) => instance,
            Err(err) => {
                attempt.advance(RelocationPhase::Rejected);
                let outcome = match err {
                    ControlPlaneError::NotSupportedComputeForRelocate { .. } => "rejected_version",
                    _ => "rejected_validation",
                };
                self.observability.record_relocation(outcome);
                warn!(instance_id = %request.instance_id, error = %err, "Relocation rejected");
                return Err(err);
            }
        };

        let target_host = match &request.target_host {
            Some(host) => match self.hosts.resolve(host).await {
                Ok(host_ref) => {
                    if host_ref.disabled {
                        warn!(
                            instance_id = %request.instance_id,
                            host = %host_ref.host,
                            cell = %host_ref.cell_id,
                            force = request.force,
                            "Relocation target compute service is disabled"
                        );
                    }
                    Some(host_ref.host)
                }
                Err(lookup) => {
                    warn!(instance_id = %request.instance_id, error = %lookup, "Relocation target lookup failed");
                    attempt.advance(RelocationPhase::Rejected);
                    self.observability.record_relocation("rejected_validation");
                    return Err(lookup.into());
                }
            },
            None => None,
        };

        let resolved = match self.resolve_credential(&request) {
            Ok(resolved) => resolved,
            Err(err) => {
                attempt.advance(RelocationPhase::Rejected);
                self.observability.record_relocation("rejected_validation");
                return Err(err);
            }
        };
        attempt.advance(RelocationPhase::CredentialResolved);

        let dispatch = RelocationDispatch {
            instance,
            host: target_host,
            on_shared_storage: resolved.on_shared_storage,
            credential: resolved.credential.clone(),
            force: request.force,
            target_state: request.stopped_target.then_some(VmState::Stopped),
        };

        attempt.advance(RelocationPhase::Dispatched);
        if let Err(failure) = self.compute.relocate(dispatch).await {
            attempt.advance(RelocationPhase::Rejected);
            self.observability.record_relocation("rejected_dispatch");
            warn!(
                instance_id = %request.instance_id,
                kind = failure.kind(),
                error = %failure,
                "Compute subsystem refused relocation"
            );
            return Err(failure.into());
        }

        attempt.advance(RelocationPhase::Accepted);
        self.observability.record_relocation("accepted");
        info!(
            instance_id = %request.instance_id,
            target_host = ?request.target_host,
            force = request.force,
            "Relocation accepted"
        );

        Ok(resolved.echo.then(|| RelocateResponse {
            admin_pass: resolved.credential,
        }))
    }

    async fn validate(&self, request: &RelocationRequest) -> ControlPlaneResult<Instance> {
        if request.force && request.target_host.is_none() {
            return Err(ControlPlaneError::BadRequest(
                "Can't force to a non-provided destination".to_string(),
            ));
        }

        let instance = self.instances.get_instance(&request.instance_id).await?;

        if let Some(target) = &request.target_host {
            if instance.host.as_deref() == Some(target.as_str()) {
                return Err(ControlPlaneError::BadRequest(
                    "The target host can't be the same one.".to_string(),
                ));
            }
        }

        if request.stopped_target {
            let minimum = self.versions.get_minimum_version(COMPUTE_SERVICE).await?;
            if !minimum.meets(STOPPED_TARGET_MIN_COMPUTE_VERSION) {
                return Err(ControlPlaneError::NotSupportedComputeForRelocate {
                    currently: minimum.as_reported(),
                    expected: STOPPED_TARGET_MIN_COMPUTE_VERSION,
                });
            }
        }

        Ok(instance)
    }

    fn resolve_credential(&self, request: &RelocationRequest) -> ControlPlaneResult<ResolvedCredential> {
        match request.credential_mode {
            CredentialMode::Legacy {
                on_shared_storage: true,
            } => {
                if request.supplied_credential.is_some() {
                    return Err(ControlPlaneError::BadRequest(
                        "admin password can't be changed on existing disk".to_string(),
                    ));
                }
                Ok(ResolvedCredential {
                    credential: None,
                    on_shared_storage: Some(true),
                    echo: self.config.enable_instance_password,
                })
            }
            CredentialMode::Legacy {
                on_shared_storage: false,
            } => Ok(ResolvedCredential {
                credential: Some(self.supplied_or_generated(request)),
                on_shared_storage: Some(false),
                echo: self.config.enable_instance_password,
            }),
            CredentialMode::Modern => Ok(ResolvedCredential {
                credential: Some(self.supplied_or_generated(request)),
                on_shared_storage: None,
                echo: false,
            }),
        }
    }

    fn supplied_or_generated(&self, request: &RelocationRequest) -> String {
        request
            .supplied_credential
            .clone()
            .unwrap_or_else(|| generate_password(self.config.password_length))
    }
}
