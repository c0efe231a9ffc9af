use crate::features::relocation::controller::RelocationController;
use crate::features::security_groups::service::SecurityGroupService;
use crate::features::server_actions::service::ServerActionService;
use crate::shared::error::ControlPlaneError;
use crate::shared::types::{RelocateResponse, RequestContext, ServerAction, ServerActionBody};
use std::sync::Arc;
use tracing::info;

const RESET_NETWORK_REMOVED: &str = "This action only worked with the Xen virt driver, \
                                     which has been removed.";

/// Controller for `POST /servers/{id}/action`
pub struct ServerActionController {
    relocation: Arc<RelocationController>,
    service: Arc<ServerActionService>,
    security_groups: Arc<SecurityGroupService>,
}

impl ServerActionController {
    pub fn new(
        relocation: Arc<RelocationController>,
        service: Arc<ServerActionService>,
        security_groups: Arc<SecurityGroupService>,
    ) -> Self {
        Self {
            relocation,
            service,
            security_groups,
        }
    }

    /// Runs the one action named in `body`. Only evacuate can return a body.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
        body: ServerActionBody,
    ) -> Result<Option<RelocateResponse>, fleetmend_core::ErrorResponse> {
        let action = ServerAction::from_body(body, ctx.api_version)?;
        info!(instance_id, action = action.name(), "Received server action");

        match action {
            ServerAction::Evacuate(evacuate) => {
                return self.relocation.evacuate(ctx, instance_id, evacuate).await
            }
            ServerAction::Lock { reason } => self.service.lock(ctx, instance_id, reason).await?,
            ServerAction::Unlock => self.service.unlock(ctx, instance_id).await?,
            ServerAction::ResetState(state) => {
                self.service.reset_state(ctx, instance_id, state).await?
            }
            ServerAction::InjectNetworkInfo => {
                self.service.inject_network_info(ctx, instance_id).await?
            }
            ServerAction::ResetNetwork => {
                return Err(ControlPlaneError::Gone(RESET_NETWORK_REMOVED.to_string()).into())
            }
            ServerAction::AddSecurityGroup(name) => {
                self.security_groups.add_to_instance(instance_id, &name).await?
            }
            ServerAction::RemoveSecurityGroup(name) => {
                self.security_groups
                    .remove_from_instance(instance_id, &name)
                    .await?
            }
        }

        Ok(None)
    }
}
