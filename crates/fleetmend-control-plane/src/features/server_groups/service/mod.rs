use crate::features::instance_management::service::{InstanceService, LiveMembership};
use crate::features::server_groups::repo::ServerGroupRepository;
use crate::features::version_registry::service::FleetVersionService;
use crate::shared::config::ControlPlaneConfig;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{
    ApiVersion, FormattedServerGroup, ListScope, NewServerGroup, Page, RequestContext,
    ServerGroup, ServerGroupPolicy, ServerGroupRules, ServiceVersion, COMPUTE_SERVICE,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Minimum compute service version that enforces `max_server_per_host > 1`.
pub const CUSTOM_MAX_SERVER_RULES_MIN_COMPUTE_VERSION: ServiceVersion = ServiceVersion::new(33);

const MAX_NAME_LENGTH: usize = 255;
const QUOTA_EXCEEDED: &str = "Quota exceeded, too many server groups.";

/// Service for server groups and their live members
pub struct ServerGroupService {
    repo: Arc<dyn ServerGroupRepository>,
    instances: Arc<InstanceService>,
    versions: Arc<FleetVersionService>,
    config: Arc<ControlPlaneConfig>,
}

impl ServerGroupService {
    pub fn new(
        repo: Arc<dyn ServerGroupRepository>,
        instances: Arc<InstanceService>,
        versions: Arc<FleetVersionService>,
        config: Arc<ControlPlaneConfig>,
    ) -> Self {
        Self {
            repo,
            instances,
            versions,
            config,
        }
    }

    pub async fn show(
        &self,
        ctx: &RequestContext,
        group_id: &str,
    ) -> ControlPlaneResult<FormattedServerGroup> {
        let group = self.get_group(group_id).await?;
        let live = self.instances.resolve_live_members(&group.members).await?;
        Ok(format_server_group(&group, &live, ctx.api_version))
    }

    /// Groups visible in `scope`, sorted by owning project then name.
    ///
    /// Members are only resolved for the groups on the requested page.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        scope: ListScope,
        page: Page,
    ) -> ControlPlaneResult<Vec<FormattedServerGroup>> {
        let mut groups = match &scope {
            ListScope::AllProjects => self.repo.list_all().await?,
            ListScope::Project(project_id) => self.repo.list_by_project(project_id).await?,
        };
        groups.sort_by(|a, b| {
            (&a.project_id, &a.name, &a.id).cmp(&(&b.project_id, &b.name, &b.id))
        });
        let groups = page.apply(groups);

        let all_members: Vec<String> = groups
            .iter()
            .flat_map(|group| group.members.iter().cloned())
            .collect();
        let live = self.instances.resolve_live_members(&all_members).await?;

        Ok(groups
            .iter()
            .map(|group| format_server_group(group, &live, ctx.api_version))
            .collect())
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        new_group: NewServerGroup,
    ) -> ControlPlaneResult<FormattedServerGroup> {
        self.check_quota(&ctx.project_id, 1).await?;

        let name = validate_name(&new_group.name)?;
        let (policy, rules) = self.policy_and_rules(ctx.api_version, &new_group).await?;

        let group = ServerGroup {
            id: Uuid::new_v4().to_string(),
            name,
            project_id: ctx.project_id.clone(),
            user_id: ctx.user_id.clone(),
            policy,
            rules,
            members: Vec::new(),
        };
        self.repo.create(group.clone()).await?;

        if self.config.recheck_quota {
            if let Err(err) = self.check_quota(&ctx.project_id, 0).await {
                warn!(group_id = %group.id, project_id = %ctx.project_id, "Quota raced, removing new server group");
                self.repo.delete(&group.id).await?;
                return Err(err);
            }
        }

        info!(group_id = %group.id, policy = policy.as_str(), "Server group created");
        Ok(format_server_group(
            &group,
            &LiveMembership::default(),
            ctx.api_version,
        ))
    }

    pub async fn delete(&self, group_id: &str) -> ControlPlaneResult<()> {
        if !self.repo.delete(group_id).await? {
            return Err(not_found(group_id));
        }
        info!(group_id, "Server group deleted");
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> ControlPlaneResult<ServerGroup> {
        self.repo
            .get(group_id)
            .await?
            .ok_or_else(|| not_found(group_id))
    }

    async fn check_quota(&self, project_id: &str, delta: usize) -> ControlPlaneResult<()> {
        let Ok(quota) = usize::try_from(self.config.server_group_quota) else {
            return Ok(());
        };
        let used = self.repo.count_by_project(project_id).await?;
        if used + delta > quota {
            return Err(ControlPlaneError::Forbidden(QUOTA_EXCEEDED.to_string()));
        }
        Ok(())
    }

    async fn policy_and_rules(
        &self,
        version: ApiVersion,
        new_group: &NewServerGroup,
    ) -> ControlPlaneResult<(ServerGroupPolicy, ServerGroupRules)> {
        if !version.is_at_least(ApiVersion::SERVER_GROUP_POLICY_RULES) {
            let policy = match new_group.policies.as_deref() {
                Some([policy]) => policy.parse::<ServerGroupPolicy>()?,
                _ => {
                    return Err(ControlPlaneError::BadRequest(
                        "policies must contain exactly one policy".to_string(),
                    ))
                }
            };
            if policy.is_soft() && !version.is_at_least(ApiVersion::SERVER_GROUP_SOFT_POLICIES) {
                return Err(ControlPlaneError::BadRequest(format!(
                    "Invalid input for field/attribute policies. Value: {} is not one of \
                     ['anti-affinity', 'affinity']",
                    policy.as_str()
                )));
            }
            return Ok((policy, ServerGroupRules::default()));
        }

        let policy = new_group
            .policy
            .as_deref()
            .ok_or_else(|| ControlPlaneError::BadRequest("policy is required".to_string()))?
            .parse::<ServerGroupPolicy>()?;
        let rules = new_group.rules.clone().unwrap_or_default();

        if policy != ServerGroupPolicy::AntiAffinity && !rules.is_empty() {
            return Err(ControlPlaneError::BadRequest(
                "Only anti-affinity policy supports rules.".to_string(),
            ));
        }

        if let Some(max) = rules.max_server_per_host {
            if max == 0 {
                return Err(ControlPlaneError::BadRequest(
                    "max_server_per_host must be at least 1".to_string(),
                ));
            }
            if max > 1 {
                let minimum = self.versions.get_minimum_version(COMPUTE_SERVICE).await?;
                if !minimum.meets(CUSTOM_MAX_SERVER_RULES_MIN_COMPUTE_VERSION) {
                    return Err(ControlPlaneError::Conflict(
                        "Creating an anti-affinity group with rule max_server_per_host > 1 \
                         is not yet supported."
                            .to_string(),
                    ));
                }
            }
        }

        Ok((policy, rules))
    }
}

fn not_found(group_id: &str) -> ControlPlaneError {
    ControlPlaneError::NotFound(format!("Instance group {group_id} could not be found."))
}

fn validate_name(name: &str) -> ControlPlaneResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ControlPlaneError::BadRequest(
            "Server group name cannot be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(ControlPlaneError::BadRequest(format!(
            "Server group name exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Shape a group for the caller's API version.
pub fn format_server_group(
    group: &ServerGroup,
    live: &LiveMembership,
    version: ApiVersion,
) -> FormattedServerGroup {
    let modern = version.is_at_least(ApiVersion::SERVER_GROUP_POLICY_RULES);
    let owned = version.is_at_least(ApiVersion::SERVER_GROUP_OWNERSHIP);

    FormattedServerGroup {
        id: group.id.clone(),
        name: group.name.clone(),
        policy: modern.then_some(group.policy),
        rules: modern.then(|| group.rules.clone()),
        policies: (!modern).then(|| vec![group.policy]),
        metadata: (!modern).then(serde_json::Map::new),
        members: live.ordered(&group.members),
        project_id: owned.then(|| group.project_id.clone()),
        user_id: owned.then(|| group.user_id.clone()),
    }
}
