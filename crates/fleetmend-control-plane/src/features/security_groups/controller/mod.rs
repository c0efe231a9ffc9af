use crate::features::security_groups::service::SecurityGroupService;
use crate::shared::config::ControlPlaneConfig;
use crate::shared::error::ControlPlaneError;
use crate::shared::types::{
    CreateSecurityGroupRuleBody, FormattedSecurityGroup, Page, RequestContext, SecurityGroupBody,
    SecurityGroupList, SecurityGroupResponse, SecurityGroupRuleResponse,
};
use std::sync::Arc;
use tracing::info;

/// Controller for security group API endpoints
pub struct SecurityGroupController {
    service: Arc<SecurityGroupService>,
    config: Arc<ControlPlaneConfig>,
}

impl SecurityGroupController {
    pub fn new(service: Arc<SecurityGroupService>, config: Arc<ControlPlaneConfig>) -> Self {
        Self { service, config }
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<SecurityGroupList, fleetmend_core::ErrorResponse> {
        info!(project_id = %ctx.project_id, "Received list security groups request");

        let page = Page::from_query(limit, offset, self.config.max_list_limit)?;
        let security_groups = self.service.list(&ctx.project_id, page).await?;
        Ok(SecurityGroupList { security_groups })
    }

    pub async fn list_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<SecurityGroupList, fleetmend_core::ErrorResponse> {
        info!(instance_id, "Received list instance security groups request");

        let security_groups = self.service.list_for_instance(instance_id).await?;
        Ok(SecurityGroupList { security_groups })
    }

    pub async fn show(
        &self,
        group_id: &str,
    ) -> Result<FormattedSecurityGroup, fleetmend_core::ErrorResponse> {
        info!(group_id, "Received show security group request");

        self.service.show(group_id).await.map_err(|e| e.into())
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        body: SecurityGroupBody,
    ) -> Result<SecurityGroupResponse, fleetmend_core::ErrorResponse> {
        info!(project_id = %ctx.project_id, "Received create security group request");

        let fields = body.security_group.ok_or_else(|| missing("security_group"))?;
        let security_group = self.service.create(ctx, fields).await?;
        Ok(SecurityGroupResponse { security_group })
    }

    pub async fn update(
        &self,
        group_id: &str,
        body: SecurityGroupBody,
    ) -> Result<SecurityGroupResponse, fleetmend_core::ErrorResponse> {
        info!(group_id, "Received update security group request");

        let fields = body.security_group.ok_or_else(|| missing("security_group"))?;
        let security_group = self.service.update(group_id, fields).await?;
        Ok(SecurityGroupResponse { security_group })
    }

    pub async fn delete(&self, group_id: &str) -> Result<(), fleetmend_core::ErrorResponse> {
        info!(group_id, "Received delete security group request");

        self.service.delete(group_id).await.map_err(|e| e.into())
    }

    pub async fn create_rule(
        &self,
        body: CreateSecurityGroupRuleBody,
    ) -> Result<SecurityGroupRuleResponse, fleetmend_core::ErrorResponse> {
        let fields = body
            .security_group_rule
            .ok_or_else(|| missing("security_group_rule"))?;
        info!(parent_group_id = ?fields.parent_group_id, "Received create security group rule request");

        let security_group_rule = self.service.create_rule(fields).await?;
        Ok(SecurityGroupRuleResponse {
            security_group_rule,
        })
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<(), fleetmend_core::ErrorResponse> {
        info!(rule_id, "Received delete security group rule request");

        self.service.delete_rule(rule_id).await.map_err(|e| e.into())
    }
}

fn missing(parameter: &str) -> ControlPlaneError {
    ControlPlaneError::BadRequest(format!("Missing parameter {parameter}"))
}
