use crate::features::instance_management::service::InstanceService;
use crate::features::relocation::repo::ComputeApi;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{Instance, LockedBy, RequestContext, VmState};
use std::sync::Arc;
use tracing::{info, warn};

const LOCK_RULE: &str = "os_compute_api:os-lock-server:lock";
const UNLOCK_RULE: &str = "os_compute_api:os-lock-server:unlock";
const UNLOCK_OVERRIDE_RULE: &str = "os_compute_api:os-lock-server:unlock:unlock_override";
const RESET_STATE_RULE: &str = "os_compute_api:os-admin-actions:reset_state";
const INJECT_NETWORK_INFO_RULE: &str = "os_compute_api:os-admin-actions:inject_network_info";

fn denied(rule: &str) -> ControlPlaneError {
    ControlPlaneError::Forbidden(format!("Policy doesn't allow {rule} to be performed."))
}

fn is_owner(ctx: &RequestContext, instance: &Instance) -> bool {
    ctx.project_id == instance.project_id
}

/// Who a lock by this caller is recorded against.
fn expected_locker(ctx: &RequestContext, instance: &Instance) -> LockedBy {
    if is_owner(ctx, instance) {
        LockedBy::Owner
    } else {
        LockedBy::Admin
    }
}

/// Lock and admin actions that change an instance in place.
pub struct ServerActionService {
    instances: Arc<InstanceService>,
    compute: Arc<dyn ComputeApi>,
}

impl ServerActionService {
    pub fn new(instances: Arc<InstanceService>, compute: Arc<dyn ComputeApi>) -> Self {
        Self { instances, compute }
    }

    /// Owners and admins may lock. A lock the owner already holds is left as is.
    pub async fn lock(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
        reason: Option<String>,
    ) -> ControlPlaneResult<()> {
        let mut instance = self.instances.get_instance(instance_id).await?;
        if !ctx.is_admin && !is_owner(ctx, &instance) {
            return Err(denied(LOCK_RULE));
        }

        if instance.locked && is_owner(ctx, &instance) {
            info!(instance_id, "Instance already locked by its owner");
            return Ok(());
        }

        let locked_by = expected_locker(ctx, &instance);
        instance.locked = true;
        instance.locked_by = Some(locked_by);
        instance.locked_reason = reason;
        self.instances.save(instance).await?;

        info!(instance_id, ?locked_by, "Instance locked");
        Ok(())
    }

    /// A lock placed by someone other than the caller's role needs the admin override.
    pub async fn unlock(&self, ctx: &RequestContext, instance_id: &str) -> ControlPlaneResult<()> {
        let mut instance = self.instances.get_instance(instance_id).await?;
        if !ctx.is_admin && !is_owner(ctx, &instance) {
            return Err(denied(UNLOCK_RULE));
        }

        let expected = expected_locker(ctx, &instance);
        let held_by_other = instance
            .locked_by
            .is_some_and(|locked_by| locked_by != expected);
        if held_by_other && !ctx.is_admin {
            warn!(instance_id, locked_by = ?instance.locked_by, "Unlock refused without override");
            return Err(denied(UNLOCK_OVERRIDE_RULE));
        }

        instance.locked = false;
        instance.locked_by = None;
        instance.locked_reason = None;
        self.instances.save(instance).await?;

        info!(instance_id, "Instance unlocked");
        Ok(())
    }

    pub async fn reset_state(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
        state: VmState,
    ) -> ControlPlaneResult<()> {
        let mut instance = self.instances.get_instance(instance_id).await?;
        if !ctx.is_admin {
            return Err(denied(RESET_STATE_RULE));
        }

        let previous = instance.vm_state;
        instance.vm_state = state;
        instance.task_state = None;
        self.instances.save(instance).await?;

        info!(instance_id, %previous, %state, "Instance state reset");
        Ok(())
    }

    pub async fn inject_network_info(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
    ) -> ControlPlaneResult<()> {
        let instance = self.instances.get_instance(instance_id).await?;
        if !ctx.is_admin {
            return Err(denied(INJECT_NETWORK_INFO_RULE));
        }

        self.compute.inject_network_info(&instance).await?;
        info!(instance_id, host = ?instance.host, "Network info injected");
        Ok(())
    }
}
