use crate::features::relocation::service::RelocationCoordinator;
use crate::shared::types::{EvacuateBody, RelocateResponse, RelocationRequest, RequestContext};
use std::sync::Arc;
use tracing::info;

/// Controller for the evacuate server action
pub struct RelocationController {
    coordinator: Arc<RelocationCoordinator>,
}

impl RelocationController {
    pub fn new(coordinator: Arc<RelocationCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Handle an evacuate server action
    pub async fn evacuate(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
        body: EvacuateBody,
    ) -> Result<Option<RelocateResponse>, fleetmend_core::ErrorResponse> {
        info!(instance_id, api_version = %ctx.api_version, "Received evacuate request");

        let request = RelocationRequest::from_body(instance_id, body, ctx.api_version)?;

        self.coordinator
            .relocate(request)
            .await
            .map_err(|e| e.into())
    }
}
