use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{Instance, RelocationDispatch, VmState};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Failures the compute subsystem can report for a relocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelocationFailure {
    #[error("Cannot '{action}' instance while it is in {attr} {state}")]
    InstanceInvalidState {
        action: &'static str,
        attr: &'static str,
        state: String,
    },
    #[error("Compute service of {0} is still in use.")]
    ComputeServiceInUse(String),
    #[error("Feature not supported with instances that have accelerators.")]
    ForbiddenPortsWithAccelerator,
    #[error("The compute service version is too old to support ports with extended resource requests.")]
    ExtendedResourceRequestOldCompute,
    #[error("Unsupported RPC version for evacuate: got {got}, expected {expected}")]
    UnsupportedRpcVersion { got: String, expected: String },
    #[error("Feature not supported because the compute nodes do not support shares.")]
    ForbiddenSharesNotSupported,
    #[error("Feature not supported with instances that have shares.")]
    ForbiddenWithShare,
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    Unexpected(String),
}

impl From<RelocationFailure> for ControlPlaneError {
    fn from(failure: RelocationFailure) -> Self {
        let message = failure.to_string();
        match failure {
            RelocationFailure::InstanceInvalidState { .. }
            | RelocationFailure::UnsupportedRpcVersion { .. }
            | RelocationFailure::ForbiddenSharesNotSupported
            | RelocationFailure::ForbiddenWithShare => ControlPlaneError::Conflict(message),
            RelocationFailure::ComputeServiceInUse(_)
            | RelocationFailure::ForbiddenPortsWithAccelerator
            | RelocationFailure::ExtendedResourceRequestOldCompute => {
                ControlPlaneError::BadRequest(message)
            }
            RelocationFailure::QuotaExceeded(_) => ControlPlaneError::Forbidden(message),
            RelocationFailure::Unexpected(_) => ControlPlaneError::Internal(message),
        }
    }
}

impl RelocationFailure {
    /// Short label used for the outcome metric.
    pub fn kind(&self) -> &'static str {
        match self {
            RelocationFailure::InstanceInvalidState { .. } => "instance_invalid_state",
            RelocationFailure::ComputeServiceInUse(_) => "compute_service_in_use",
            RelocationFailure::ForbiddenPortsWithAccelerator => "ports_with_accelerator",
            RelocationFailure::ExtendedResourceRequestOldCompute => "extended_resource_request",
            RelocationFailure::UnsupportedRpcVersion { .. } => "unsupported_rpc_version",
            RelocationFailure::ForbiddenSharesNotSupported => "shares_not_supported",
            RelocationFailure::ForbiddenWithShare => "with_share",
            RelocationFailure::QuotaExceeded(_) => "quota_exceeded",
            RelocationFailure::Unexpected(_) => "unexpected",
        }
    }
}

/// Compute-management subsystem that carries out relocations and other
/// host-side instance operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn relocate(&self, dispatch: RelocationDispatch) -> Result<(), RelocationFailure>;

    /// Ask the instance's host to push fresh network configuration into the guest.
    async fn inject_network_info(&self, instance: &Instance) -> ControlPlaneResult<()>;
}

/// States an instance can be relocated from.
pub const EVACUABLE_STATES: [VmState; 3] = [VmState::Active, VmState::Stopped, VmState::Error];

/// In-memory compute subsystem that records what it was asked to do
#[derive(Clone, Default)]
pub struct InMemoryComputeApi {
    dispatched: Arc<RwLock<Vec<RelocationDispatch>>>,
    hosts_in_use: Arc<RwLock<HashSet<String>>>,
    network_injections: Arc<RwLock<Vec<String>>>,
}

impl InMemoryComputeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat the compute service on `host` as still running.
    pub async fn mark_in_use(&self, host: impl Into<String>) {
        let mut hosts = self.hosts_in_use.write().await;
        hosts.insert(host.into());
    }

    pub async fn dispatched(&self) -> Vec<RelocationDispatch> {
        self.dispatched.read().await.clone()
    }

    /// Instances that had network info injected, in call order.
    pub async fn network_injections(&self) -> Vec<String> {
        self.network_injections.read().await.clone()
    }
}

#[async_trait]
impl ComputeApi for InMemoryComputeApi {
    async fn relocate(&self, dispatch: RelocationDispatch) -> Result<(), RelocationFailure> {
        if !EVACUABLE_STATES.contains(&dispatch.instance.vm_state) {
            return Err(RelocationFailure::InstanceInvalidState {
                action: "evacuate",
                attr: "vm_state",
                state: dispatch.instance.vm_state.to_string(),
            });
        }

        if let Some(source) = &dispatch.instance.host {
            if self.hosts_in_use.read().await.contains(source) {
                return Err(RelocationFailure::ComputeServiceInUse(source.clone()));
            }
        }

        let mut dispatched = self.dispatched.write().await;
        dispatched.push(dispatch);
        Ok(())
    }

    async fn inject_network_info(&self, instance: &Instance) -> ControlPlaneResult<()> {
        if instance.host.is_none() {
            return Err(ControlPlaneError::Conflict(format!(
                "Instance {} is not assigned to a host",
                instance.id
            )));
        }
        let mut injections = self.network_injections.write().await;
        injections.push(instance.id.clone());
        Ok(())
    }
}
