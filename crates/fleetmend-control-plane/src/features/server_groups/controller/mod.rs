use crate::features::server_groups::service::ServerGroupService;
use crate::shared::config::ControlPlaneConfig;
use crate::shared::types::{
    CreateServerGroupBody, FormattedServerGroup, ListScope, Page, RequestContext,
    ServerGroupList, ServerGroupListQuery,
};
use std::sync::Arc;
use tracing::info;

/// Controller for server group API endpoints
pub struct ServerGroupController {
    service: Arc<ServerGroupService>,
    config: Arc<ControlPlaneConfig>,
}

impl ServerGroupController {
    pub fn new(service: Arc<ServerGroupService>, config: Arc<ControlPlaneConfig>) -> Self {
        Self { service, config }
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        query: ServerGroupListQuery,
    ) -> Result<ServerGroupList, fleetmend_core::ErrorResponse> {
        info!(project_id = %ctx.project_id, "Received list server groups request");

        let page = Page::from_query(query.limit, query.offset, self.config.max_list_limit)?;
        // Non-admins asking for every project just get their own.
        let scope = if query.all_projects.is_some() && ctx.is_admin {
            ListScope::AllProjects
        } else {
            ListScope::Project(ctx.project_id.clone())
        };

        let server_groups = self.service.list(ctx, scope, page).await?;
        Ok(ServerGroupList { server_groups })
    }

    pub async fn show(
        &self,
        ctx: &RequestContext,
        group_id: &str,
    ) -> Result<FormattedServerGroup, fleetmend_core::ErrorResponse> {
        info!(group_id, "Received show server group request");

        self.service.show(ctx, group_id).await.map_err(|e| e.into())
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        body: CreateServerGroupBody,
    ) -> Result<FormattedServerGroup, fleetmend_core::ErrorResponse> {
        info!(project_id = %ctx.project_id, name = %body.server_group.name, "Received create server group request");

        self.service
            .create(ctx, body.server_group)
            .await
            .map_err(|e| e.into())
    }

    pub async fn delete(&self, group_id: &str) -> Result<(), fleetmend_core::ErrorResponse> {
        info!(group_id, "Received delete server group request");

        self.service.delete(group_id).await.map_err(|e| e.into())
    }
}
