use crate::features::instance_management::service::InstanceService;
use crate::features::observability::service::ObservabilityService;
use crate::features::security_groups::repo::SecurityGroupRepository;
use crate::shared::config::ControlPlaneConfig;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{
    FormattedSecurityGroup, FormattedSecurityGroupRule, IpRange, NewSecurityGroupRule, Page,
    PortValue, RequestContext, RuleGroupRef, SecurityGroup, SecurityGroupFields,
    SecurityGroupRule,
};
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_GROUP: &str = "default";
const MAX_PROPERTY_LEN: usize = 255;
const ANY_NETWORK: &str = "0.0.0.0/0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleGroupLookup {
    Found(RuleGroupRef),
    /// The group was deleted after the rule was read.
    Missing,
}

/// Per-call answers for the groups that rules point at.
///
/// Seeded with the groups being formatted, so self-references never cost a
/// lookup. Any other id is looked up once, hit or miss.
#[derive(Debug, Default)]
pub struct GroupRuleResolutionCache {
    entries: HashMap<String, RuleGroupLookup>,
}

impl GroupRuleResolutionCache {
    pub fn seeded(groups: &[SecurityGroup]) -> Self {
        let entries = groups
            .iter()
            .map(|group| (group.id.clone(), RuleGroupLookup::Found(group_ref(group))))
            .collect();
        Self { entries }
    }

    pub async fn build(
        repo: &dyn SecurityGroupRepository,
        groups: &[SecurityGroup],
    ) -> ControlPlaneResult<Self> {
        let mut cache = Self::seeded(groups);

        for rule in groups.iter().flat_map(|group| group.rules.iter()) {
            let Some(group_id) = &rule.group_id else {
                continue;
            };
            if cache.entries.contains_key(group_id) {
                continue;
            }

            let lookup = match repo.get(group_id).await? {
                Some(source) => RuleGroupLookup::Found(group_ref(&source)),
                None => {
                    debug!(group_id = %group_id, "Security group referenced by a rule does not exist");
                    RuleGroupLookup::Missing
                }
            };
            cache.entries.insert(group_id.clone(), lookup);
        }

        Ok(cache)
    }

    pub fn get(&self, group_id: &str) -> Option<&RuleGroupLookup> {
        self.entries.get(group_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn group_ref(group: &SecurityGroup) -> RuleGroupRef {
    RuleGroupRef {
        name: Some(group.name.clone()),
        tenant_id: Some(group.project_id.clone()),
    }
}

/// Validated ingress rule fields, before the rule gets an id and a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: Option<String>,
    pub from_port: Option<i32>,
    pub to_port: Option<i32>,
    pub source: RuleSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    Group(String),
    Network(IpNetwork),
}

impl IngressRule {
    /// Builds a rule from request fields.
    ///
    /// A rule naming a source group may leave protocol and ports out. A
    /// network rule needs both, and `Ok(None)` says they were missing. A
    /// missing network means any IPv4 address.
    pub fn build(fields: &NewSecurityGroupRule) -> ControlPlaneResult<Option<Self>> {
        let source = match &fields.group_id {
            Some(group_id) => RuleSource::Group(group_id.clone()),
            None => RuleSource::Network(parse_cidr(fields.cidr.as_deref())?),
        };

        let protocol = fields
            .ip_protocol
            .as_deref()
            .map(|protocol| protocol.trim().to_ascii_lowercase())
            .filter(|protocol| !protocol.is_empty());
        let mut from_port = port(fields.from_port.as_ref(), protocol.as_deref())?;
        let mut to_port = port(fields.to_port.as_ref(), protocol.as_deref())?;

        if let Some(protocol) = &protocol {
            if !matches!(protocol.as_str(), "tcp" | "udp" | "icmp") {
                return Err(ControlPlaneError::BadRequest(format!(
                    "Invalid IP protocol {protocol}."
                )));
            }
            if from_port.is_none() && to_port.is_none() {
                (from_port, to_port) = if protocol == "icmp" {
                    (Some(-1), Some(-1))
                } else {
                    (Some(1), Some(65535))
                };
            }
        }

        match (&protocol, from_port, to_port) {
            (Some(protocol), Some(from), Some(to)) => validate_port_range(protocol, from, to)?,
            _ if matches!(source, RuleSource::Network(_)) => return Ok(None),
            _ => {}
        }

        Ok(Some(Self {
            protocol,
            from_port,
            to_port,
            source,
        }))
    }

    fn matches(&self, rule: &SecurityGroupRule) -> bool {
        let (group_id, cidr) = match &self.source {
            RuleSource::Group(group_id) => (Some(group_id.clone()), None),
            RuleSource::Network(network) => (None, Some(network.to_string())),
        };
        rule.protocol == self.protocol
            && rule.from_port == self.from_port
            && rule.to_port == self.to_port
            && rule.group_id == group_id
            && rule.cidr == cidr
    }

    fn into_rule(self, parent_group_id: &str) -> SecurityGroupRule {
        let (group_id, cidr) = match self.source {
            RuleSource::Group(group_id) => (Some(group_id), None),
            RuleSource::Network(network) => (None, Some(network.to_string())),
        };
        SecurityGroupRule {
            id: Uuid::new_v4().to_string(),
            parent_group_id: parent_group_id.to_string(),
            protocol: self.protocol,
            from_port: self.from_port,
            to_port: self.to_port,
            group_id,
            cidr,
        }
    }
}

fn parse_cidr(cidr: Option<&str>) -> ControlPlaneResult<IpNetwork> {
    let cidr = cidr.map(str::trim).filter(|cidr| !cidr.is_empty());
    let text = cidr.unwrap_or(ANY_NETWORK);
    let network: IpNetwork = text.parse().map_err(|_| {
        ControlPlaneError::BadRequest(format!("{text} is not a valid IP network."))
    })?;

    if network.prefix() == 0 && !network.ip().is_unspecified() {
        return Err(ControlPlaneError::BadRequest(format!(
            "Bad prefix for network in cidr {text}"
        )));
    }
    Ok(network)
}

fn port(value: Option<&PortValue>, protocol: Option<&str>) -> ControlPlaneResult<Option<i32>> {
    let Some(value) = value else {
        return Ok(None);
    };
    value.to_port().map(Some).ok_or_else(|| {
        let message = if protocol == Some("icmp") {
            "Type and Code must be integers for ICMP protocol type"
        } else {
            "To and From ports must be integers"
        };
        ControlPlaneError::BadRequest(message.to_string())
    })
}

fn validate_port_range(protocol: &str, from: i32, to: i32) -> ControlPlaneResult<()> {
    let invalid = |reason: String| {
        Err(ControlPlaneError::BadRequest(format!(
            "Invalid port range {from}:{to}. {reason}"
        )))
    };

    match protocol {
        "tcp" | "udp" if from > to => {
            invalid("Former value cannot be greater than the later".to_string())
        }
        "tcp" | "udp" if from < 1 || to > 65535 => invalid(format!(
            "Valid {} ports should be between 1-65535",
            protocol.to_ascii_uppercase()
        )),
        "icmp" if !(-1..=255).contains(&from) || !(-1..=255).contains(&to) => {
            invalid("For ICMP, the type:code must be valid".to_string())
        }
        _ => Ok(()),
    }
}

fn validate_property(value: Option<&str>, property: &str) -> ControlPlaneResult<String> {
    let value = value.ok_or_else(|| {
        ControlPlaneError::BadRequest(format!("Security group {property} is not a string"))
    })?;
    let value = value.trim();
    if value.is_empty() {
        return Err(ControlPlaneError::BadRequest(format!(
            "Security group {property} cannot be empty."
        )));
    }
    if value.chars().count() > MAX_PROPERTY_LEN {
        return Err(ControlPlaneError::BadRequest(format!(
            "Security group {property} should not be greater than {MAX_PROPERTY_LEN} characters."
        )));
    }
    Ok(value.to_string())
}

fn not_found(group_id: &str) -> ControlPlaneError {
    ControlPlaneError::NotFound(format!("Security group {group_id} not found."))
}

/// Service for security groups, their rules and instance attachments
pub struct SecurityGroupService {
    repo: Arc<dyn SecurityGroupRepository>,
    instances: Arc<InstanceService>,
    config: Arc<ControlPlaneConfig>,
    observability: Arc<ObservabilityService>,
}

impl SecurityGroupService {
    pub fn new(
        repo: Arc<dyn SecurityGroupRepository>,
        instances: Arc<InstanceService>,
        config: Arc<ControlPlaneConfig>,
        observability: Arc<ObservabilityService>,
    ) -> Self {
        Self {
            repo,
            instances,
            config,
            observability,
        }
    }

    /// Groups owned by `project_id`, sorted by (tenant_id, name).
    pub async fn list(
        &self,
        project_id: &str,
        page: Page,
    ) -> ControlPlaneResult<Vec<FormattedSecurityGroup>> {
        let mut groups = self.repo.list_by_project(project_id).await?;
        sort_groups(&mut groups);
        let groups = page.apply(groups);
        self.format_all(&groups).await
    }

    pub async fn list_for_instance(
        &self,
        instance_id: &str,
    ) -> ControlPlaneResult<Vec<FormattedSecurityGroup>> {
        self.instances.get_instance(instance_id).await?;

        let mut groups = self.repo.list_for_instance(instance_id).await?;
        sort_groups(&mut groups);
        self.format_all(&groups).await
    }

    pub async fn show(&self, group_id: &str) -> ControlPlaneResult<FormattedSecurityGroup> {
        let group = self.get_group(group_id).await?;

        let groups = [group];
        let cache = GroupRuleResolutionCache::build(self.repo.as_ref(), &groups).await?;
        Ok(self.format_group(&groups[0], &cache))
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        fields: SecurityGroupFields,
    ) -> ControlPlaneResult<FormattedSecurityGroup> {
        let name = validate_property(fields.name.as_deref(), "name")?;
        let description = validate_property(fields.description.as_deref(), "description")?;

        if let Ok(quota) = usize::try_from(self.config.security_group_quota) {
            if self.repo.count_by_project(&ctx.project_id).await? + 1 > quota {
                return Err(ControlPlaneError::Forbidden(
                    "Quota exceeded, too many security groups.".to_string(),
                ));
            }
        }

        let group = SecurityGroup {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            project_id: ctx.project_id.clone(),
            rules: Vec::new(),
        };
        self.repo.create(group.clone()).await?;

        info!(group_id = %group.id, project_id = %group.project_id, "Security group created");
        Ok(self.format_group(&group, &GroupRuleResolutionCache::default()))
    }

    pub async fn update(
        &self,
        group_id: &str,
        fields: SecurityGroupFields,
    ) -> ControlPlaneResult<FormattedSecurityGroup> {
        let mut group = self.get_group(group_id).await?;
        let name = validate_property(fields.name.as_deref(), "name")?;
        let description = validate_property(fields.description.as_deref(), "description")?;

        if group.name == DEFAULT_GROUP && name != DEFAULT_GROUP {
            return Err(ControlPlaneError::BadRequest(format!(
                "Unable to update system group '{DEFAULT_GROUP}'"
            )));
        }

        group.name = name;
        group.description = description;
        if !self.repo.update(group.clone()).await? {
            return Err(not_found(group_id));
        }

        info!(group_id, "Security group updated");
        let groups = [group];
        let cache = GroupRuleResolutionCache::build(self.repo.as_ref(), &groups).await?;
        Ok(self.format_group(&groups[0], &cache))
    }

    /// Rules in other groups that point at this one are left dangling and
    /// drop out of later listings.
    pub async fn delete(&self, group_id: &str) -> ControlPlaneResult<()> {
        let group = self.get_group(group_id).await?;
        if group.name == DEFAULT_GROUP {
            return Err(ControlPlaneError::BadRequest(
                "Removing default security group not allowed.".to_string(),
            ));
        }

        let in_use = self.repo.instances_using(group_id).await?;
        if !in_use.is_empty() {
            debug!(group_id, instances = in_use.len(), "Refusing to delete attached security group");
            return Err(ControlPlaneError::BadRequest(format!(
                "Security Group {group_id} in use."
            )));
        }

        if !self.repo.delete(group_id).await? {
            return Err(not_found(group_id));
        }
        info!(group_id, "Security group deleted");
        Ok(())
    }

    pub async fn create_rule(
        &self,
        fields: NewSecurityGroupRule,
    ) -> ControlPlaneResult<FormattedSecurityGroupRule> {
        let parent_id = fields.parent_group_id.as_deref().ok_or_else(|| {
            ControlPlaneError::BadRequest("Missing parameter parent_group_id".to_string())
        })?;
        let mut parent = self.get_group(parent_id).await?;

        let source = match &fields.group_id {
            Some(group_id) => Some(self.get_group(group_id).await?),
            None => None,
        };

        let ingress = IngressRule::build(&fields)?.ok_or_else(|| {
            ControlPlaneError::BadRequest("Not enough parameters to build a valid rule.".to_string())
        })?;

        if parent.rules.iter().any(|rule| ingress.matches(rule)) {
            return Err(ControlPlaneError::BadRequest(format!(
                "This rule already exists in group {}",
                parent.id
            )));
        }
        if let Ok(quota) = usize::try_from(self.config.security_group_rule_quota) {
            if parent.rules.len() + 1 > quota {
                return Err(ControlPlaneError::Forbidden(
                    "Quota exceeded, too many security group rules.".to_string(),
                ));
            }
        }

        let rule = ingress.into_rule(&parent.id);
        parent.rules.push(rule.clone());
        if !self.repo.update(parent.clone()).await? {
            return Err(not_found(&parent.id));
        }
        info!(rule_id = %rule.id, group_id = %parent.id, "Security group rule created");

        let mut known = vec![parent];
        known.extend(source);
        let cache = GroupRuleResolutionCache::seeded(&known);
        self.format_rule(&rule, &cache)
            .ok_or_else(|| ControlPlaneError::Internal(format!("rule {} has no source", rule.id)))
    }

    pub async fn delete_rule(&self, rule_id: &str) -> ControlPlaneResult<()> {
        let mut parents = self.repo.find_rule_parents(rule_id).await?;
        let mut parent = match parents.len() {
            0 => {
                return Err(ControlPlaneError::NotFound(format!(
                    "Rule ({rule_id}) not found."
                )))
            }
            1 => parents.remove(0),
            _ => {
                return Err(ControlPlaneError::Conflict(format!(
                    "Multiple security group rules match {rule_id}."
                )))
            }
        };

        parent.rules.retain(|rule| rule.id != rule_id);
        if !self.repo.update(parent.clone()).await? {
            return Err(ControlPlaneError::NotFound(format!(
                "Rule ({rule_id}) not found."
            )));
        }
        info!(rule_id, group_id = %parent.id, "Security group rule deleted");
        Ok(())
    }

    pub async fn add_to_instance(&self, instance_id: &str, name: &str) -> ControlPlaneResult<()> {
        let (instance_id, group) = self.resolve_for_instance(instance_id, name).await?;
        if !self.repo.attach(&instance_id, &group.id).await? {
            return Err(ControlPlaneError::BadRequest(format!(
                "Security group {name} is already associated with the instance {instance_id}"
            )));
        }
        info!(%instance_id, group_id = %group.id, "Security group added to instance");
        Ok(())
    }

    pub async fn remove_from_instance(
        &self,
        instance_id: &str,
        name: &str,
    ) -> ControlPlaneResult<()> {
        let (instance_id, group) = self.resolve_for_instance(instance_id, name).await?;
        if !self.repo.detach(&instance_id, &group.id).await? {
            return Err(ControlPlaneError::BadRequest(format!(
                "Security group {name} not associated with the instance {instance_id}"
            )));
        }
        info!(%instance_id, group_id = %group.id, "Security group removed from instance");
        Ok(())
    }

    /// The instance and the one group in its project named or identified by `name`.
    async fn resolve_for_instance(
        &self,
        instance_id: &str,
        name: &str,
    ) -> ControlPlaneResult<(String, SecurityGroup)> {
        let instance = self.instances.get_instance(instance_id).await?;
        let mut matches = self
            .repo
            .find_by_name_or_id(&instance.project_id, name)
            .await?;

        match matches.len() {
            0 => Err(ControlPlaneError::NotFound(format!(
                "Security group {name} not found for project {}.",
                instance.project_id
            ))),
            1 => Ok((instance.id, matches.remove(0))),
            _ => Err(ControlPlaneError::Conflict(format!(
                "Multiple security groups found matching '{name}'. Use an ID to be more specific."
            ))),
        }
    }

    async fn get_group(&self, group_id: &str) -> ControlPlaneResult<SecurityGroup> {
        self.repo
            .get(group_id)
            .await?
            .ok_or_else(|| not_found(group_id))
    }

    async fn format_all(
        &self,
        groups: &[SecurityGroup],
    ) -> ControlPlaneResult<Vec<FormattedSecurityGroup>> {
        let cache = GroupRuleResolutionCache::build(self.repo.as_ref(), groups).await?;
        debug!(groups = groups.len(), cached = cache.len(), "Resolved rule group references");
        Ok(groups
            .iter()
            .map(|group| self.format_group(group, &cache))
            .collect())
    }

    fn format_group(
        &self,
        group: &SecurityGroup,
        cache: &GroupRuleResolutionCache,
    ) -> FormattedSecurityGroup {
        FormattedSecurityGroup {
            id: group.id.clone(),
            name: group.name.clone(),
            description: group.description.clone(),
            tenant_id: group.project_id.clone(),
            rules: group
                .rules
                .iter()
                .filter_map(|rule| self.format_rule(rule, cache))
                .collect(),
        }
    }

    /// `None` when the rule points at a group that no longer exists.
    fn format_rule(
        &self,
        rule: &SecurityGroupRule,
        cache: &GroupRuleResolutionCache,
    ) -> Option<FormattedSecurityGroupRule> {
        let (group, ip_range) = match &rule.group_id {
            Some(group_id) => match cache.get(group_id) {
                Some(RuleGroupLookup::Found(group)) => (group.clone(), IpRange::default()),
                Some(RuleGroupLookup::Missing) | None => {
                    debug!(rule_id = %rule.id, group_id = %group_id, "Skipping rule with dangling group reference");
                    self.observability.record_dangling_rule_reference();
                    return None;
                }
            },
            None => (
                RuleGroupRef::default(),
                IpRange {
                    cidr: rule.cidr.clone(),
                },
            ),
        };

        Some(FormattedSecurityGroupRule {
            id: rule.id.clone(),
            parent_group_id: rule.parent_group_id.clone(),
            ip_protocol: rule.protocol.clone(),
            from_port: rule.from_port,
            to_port: rule.to_port,
            group,
            ip_range,
        })
    }
}

fn sort_groups(groups: &mut [SecurityGroup]) {
    groups.sort_by(|a, b| (&a.project_id, &a.name, &a.id).cmp(&(&b.project_id, &b.name, &b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::instance_management::repo::{InMemoryInstanceRepository, InstanceRepository};
    use crate::features::security_groups::repo::InMemorySecurityGroupRepository;
    use crate::shared::config::ControlPlaneConfig;
    use crate::shared::types::{Instance, VmState};
    use proptest::prelude::*;

    fn rule(id: &str, parent: &str, group_id: Option<&str>) -> SecurityGroupRule {
        SecurityGroupRule {
            id: id.to_string(),
            parent_group_id: parent.to_string(),
            protocol: Some("tcp".to_string()),
            from_port: Some(22),
            to_port: Some(22),
            group_id: group_id.map(str::to_string),
            cidr: group_id.is_none().then(|| "10.0.0.0/8".to_string()),
        }
    }

    fn group(id: &str, name: &str, project: &str, rules: Vec<SecurityGroupRule>) -> SecurityGroup {
        SecurityGroup {
            id: id.to_string(),
            name: name.to_string(),
            description: format!("{name} group"),
            project_id: project.to_string(),
            rules,
        }
    }

    struct Fixture {
        repo: InMemorySecurityGroupRepository,
        instances: InMemoryInstanceRepository,
        observability: Arc<ObservabilityService>,
        service: SecurityGroupService,
    }

    fn fixture() -> Fixture {
        fixture_with(ControlPlaneConfig::default())
    }

    fn fixture_with(config: ControlPlaneConfig) -> Fixture {
        let config = Arc::new(config);
        let repo = InMemorySecurityGroupRepository::new();
        let instances = InMemoryInstanceRepository::new();
        let observability = Arc::new(ObservabilityService::with_new_registry().unwrap());
        let instance_service = Arc::new(InstanceService::new(
            Arc::new(instances.clone()),
            Arc::clone(&config),
            Arc::clone(&observability),
        ));

        Fixture {
            service: SecurityGroupService::new(
                Arc::new(repo.clone()),
                instance_service,
                config,
                Arc::clone(&observability),
            ),
            repo,
            instances,
            observability,
        }
    }

    fn page() -> Page {
        Page {
            offset: 0,
            limit: 1000,
        }
    }

    #[tokio::test]
    async fn test_dangling_reference_drops_only_that_rule() {
        let fx = fixture();
        fx.repo
            .create(group(
                "g1",
                "web",
                "p1",
                vec![rule("r1", "g1", Some("g2")), rule("r2", "g1", None)],
            ))
            .await.unwrap();
        fx.repo.create(group("g2", "db", "p2", vec![])).await.unwrap();
        fx.repo.delete("g2").await.unwrap();

        let listed = fx.service.list("p1", page()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "g1");
        assert_eq!(listed[0].rules.len(), 1);
        assert_eq!(listed[0].rules[0].id, "r2");
        assert_eq!(
            listed[0].rules[0].ip_range.cidr.as_deref(),
            Some("10.0.0.0/8")
        );
        assert_eq!(fx.observability.dangling_rule_reference_count(), 1);
    }

    #[tokio::test]
    async fn test_cross_reference_resolved_once() {
        let fx = fixture();
        fx.repo
            .create(group(
                "g1",
                "web",
                "p1",
                vec![
                    rule("r1", "g1", Some("shared")),
                    rule("r2", "g1", Some("shared")),
                    rule("r3", "g1", Some("shared")),
                ],
            ))
            .await.unwrap();
        fx.repo.create(group("shared", "infra", "p9", vec![])).await.unwrap();

        let listed = fx.service.list("p1", page()).await.unwrap();
        assert_eq!(listed[0].rules.len(), 3);
        assert_eq!(
            listed[0].rules[0].group,
            RuleGroupRef {
                name: Some("infra".into()),
                tenant_id: Some("p9".into()),
            }
        );
        assert_eq!(fx.repo.lookups(), 1);
    }

    #[tokio::test]
    async fn test_sorted_by_tenant_then_name() {
        let fx = fixture();
        fx.repo.create(group("g1", "zeta", "p1", vec![])).await.unwrap();
        fx.repo.create(group("g2", "alpha", "p1", vec![])).await.unwrap();
        fx.repo.create(group("g3", "mid", "p1", vec![])).await.unwrap();

        let names: Vec<String> = fx
            .service
            .list("p1", page())
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_list_for_instance() {
        let fx = fixture();
        fx.instances
            .upsert(Instance::new("i1", "p1", "u1", None, VmState::Active))
            .await
            .unwrap();
        fx.repo.create(group("g1", "web", "p1", vec![])).await.unwrap();
        fx.repo.create(group("g2", "db", "p1", vec![])).await.unwrap();
        fx.repo.attach("i1", "g1").await.unwrap();
        fx.repo.attach("i1", "g2").await.unwrap();

        let groups = fx.service.list_for_instance("i1").await.unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);

        let err = fx.service.list_for_instance("missing").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_show() {
        let fx = fixture();
        fx.repo
            .create(group("g1", "web", "p1", vec![rule("r1", "g1", Some("g1"))]))
            .await.unwrap();

        let shown = fx.service.show("g1").await.unwrap();
        assert_eq!(shown.rules[0].group.name.as_deref(), Some("web"));
        // One lookup for the group itself, none for the rule.
        assert_eq!(fx.repo.lookups(), 1);

        let err = fx.service.show("nope").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    fn fields(name: &str, description: &str) -> SecurityGroupFields {
        SecurityGroupFields {
            name: Some(name.to_string()),
            description: Some(description.to_string()),
        }
    }

    fn new_rule(json: serde_json::Value) -> NewSecurityGroupRule {
        serde_json::from_value(json).unwrap()
    }

    fn bad_request_message(err: ControlPlaneError) -> String {
        match err {
            ControlPlaneError::BadRequest(message) => message,
            other => panic!("expected a bad request, got {other:?}"),
        }
    }

    async fn add_instance(fx: &Fixture, id: &str, project: &str) {
        fx.instances
            .upsert(Instance::new(id, project, "u1", None, VmState::Active))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_group_trims_and_validates() {
        let fx = fixture();
        let ctx = RequestContext::new("p1", "u1");

        let created = fx.service.create(&ctx, fields("  web ", "frontends")).await.unwrap();
        assert_eq!(created.name, "web");
        assert_eq!(created.tenant_id, "p1");
        assert!(created.rules.is_empty());
        assert!(fx.repo.get(&created.id).await.unwrap().is_some());

        let err = fx.service.create(&ctx, fields("   ", "x")).await.unwrap_err();
        assert_eq!(bad_request_message(err), "Security group name cannot be empty.");

        let err = fx
            .service
            .create(&ctx, fields("web", &"d".repeat(256)))
            .await
            .unwrap_err();
        assert!(bad_request_message(err).contains("description should not be greater than 255"));

        let missing = SecurityGroupFields {
            name: Some("db".to_string()),
            description: None,
        };
        let err = fx.service.create(&ctx, missing).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_create_group_quota() {
        let fx = fixture_with(ControlPlaneConfig {
            security_group_quota: 1,
            ..Default::default()
        });
        let ctx = RequestContext::new("p1", "u1");

        fx.service.create(&ctx, fields("web", "x")).await.unwrap();
        let err = fx.service.create(&ctx, fields("db", "x")).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Forbidden(_)));

        // Quota is per project.
        let other = RequestContext::new("p2", "u2");
        fx.service.create(&other, fields("web", "x")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_group() {
        let fx = fixture();
        fx.repo
            .create(group("g1", "web", "p1", vec![rule("r1", "g1", None)]))
            .await
            .unwrap();

        let updated = fx.service.update("g1", fields("frontend", "edge")).await.unwrap();
        assert_eq!(updated.name, "frontend");
        assert_eq!(updated.description, "edge");
        assert_eq!(updated.rules.len(), 1);

        let err = fx.service.update("nope", fields("a", "b")).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));

        fx.repo.create(group("g0", "default", "p1", vec![])).await.unwrap();
        let err = fx.service.update("g0", fields("renamed", "b")).await.unwrap_err();
        assert!(bad_request_message(err).contains("default"));
    }

    #[tokio::test]
    async fn test_delete_group() {
        let fx = fixture();
        add_instance(&fx, "i1", "p1").await;
        fx.repo.create(group("g0", "default", "p1", vec![])).await.unwrap();
        fx.repo.create(group("g1", "web", "p1", vec![])).await.unwrap();
        fx.repo
            .create(group("g2", "db", "p1", vec![rule("r1", "g2", Some("g1"))]))
            .await
            .unwrap();
        fx.repo.attach("i1", "g1").await.unwrap();

        let err = fx.service.delete("g0").await.unwrap_err();
        assert_eq!(
            bad_request_message(err),
            "Removing default security group not allowed."
        );

        let err = fx.service.delete("g1").await.unwrap_err();
        assert!(bad_request_message(err).contains("in use"));

        fx.repo.detach("i1", "g1").await.unwrap();
        fx.service.delete("g1").await.unwrap();
        assert!(fx.repo.get("g1").await.unwrap().is_none());

        // The rule pointing at the deleted group is hidden, not removed.
        let shown = fx.service.show("g2").await.unwrap();
        assert!(shown.rules.is_empty());
        assert_eq!(fx.repo.get("g2").await.unwrap().unwrap().rules.len(), 1);

        let err = fx.service.delete("g1").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    #[test]
    fn test_ingress_rule_defaults() {
        let icmp = IngressRule::build(&new_rule(serde_json::json!({
            "parent_group_id": "g1", "ip_protocol": "ICMP"
        })))
        .unwrap()
        .unwrap();
        assert_eq!((icmp.from_port, icmp.to_port), (Some(-1), Some(-1)));
        assert_eq!(icmp.protocol.as_deref(), Some("icmp"));
        assert_eq!(
            icmp.source,
            RuleSource::Network("0.0.0.0/0".parse().unwrap())
        );

        let tcp = IngressRule::build(&new_rule(serde_json::json!({
            "parent_group_id": "g1", "ip_protocol": "tcp", "cidr": "10.0.0.0/8"
        })))
        .unwrap()
        .unwrap();
        assert_eq!((tcp.from_port, tcp.to_port), (Some(1), Some(65535)));
    }

    #[test]
    fn test_ingress_rule_group_source_needs_no_ports() {
        let rule = IngressRule::build(&new_rule(serde_json::json!({
            "parent_group_id": "g1", "group_id": "g2", "cidr": "bogus"
        })))
        .unwrap()
        .unwrap();
        assert_eq!(rule.source, RuleSource::Group("g2".to_string()));
        assert!(rule.protocol.is_none());

        let missing = IngressRule::build(&new_rule(serde_json::json!({
            "parent_group_id": "g1", "cidr": "10.0.0.0/8"
        })))
        .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_ingress_rule_validation_messages() {
        let build = |json: serde_json::Value| {
            bad_request_message(IngressRule::build(&new_rule(json)).unwrap_err())
        };

        assert_eq!(
            build(serde_json::json!({"ip_protocol": "tcp", "cidr": "1.2.3.4/0"})),
            "Bad prefix for network in cidr 1.2.3.4/0"
        );
        assert_eq!(
            build(serde_json::json!({"ip_protocol": "tcp", "cidr": "10.0.0.300/8"})),
            "10.0.0.300/8 is not a valid IP network."
        );
        assert_eq!(
            build(serde_json::json!({"ip_protocol": "gre", "from_port": 1, "to_port": 2})),
            "Invalid IP protocol gre."
        );
        assert_eq!(
            build(serde_json::json!({"ip_protocol": "tcp", "from_port": 90, "to_port": 80})),
            "Invalid port range 90:80. Former value cannot be greater than the later"
        );
        assert_eq!(
            build(serde_json::json!({"ip_protocol": "udp", "from_port": 0, "to_port": 80})),
            "Invalid port range 0:80. Valid UDP ports should be between 1-65535"
        );
        assert_eq!(
            build(serde_json::json!({"ip_protocol": "icmp", "from_port": 8, "to_port": 256})),
            "Invalid port range 8:256. For ICMP, the type:code must be valid"
        );
        assert_eq!(
            build(serde_json::json!({"ip_protocol": "icmp", "from_port": "echo", "to_port": 0})),
            "Type and Code must be integers for ICMP protocol type"
        );
        assert_eq!(
            build(serde_json::json!({"ip_protocol": "tcp", "from_port": "ssh", "to_port": 22})),
            "To and From ports must be integers"
        );

        // The unspecified address may use a zero prefix.
        let any = IngressRule::build(&new_rule(serde_json::json!({
            "ip_protocol": "tcp", "from_port": "22", "to_port": 22, "cidr": "::/0"
        })))
        .unwrap()
        .unwrap();
        assert_eq!(any.from_port, Some(22));
    }

    #[tokio::test]
    async fn test_create_rule_from_network() {
        let fx = fixture();
        fx.repo.create(group("g1", "web", "p1", vec![])).await.unwrap();

        let created = fx
            .service
            .create_rule(new_rule(serde_json::json!({
                "parent_group_id": "g1",
                "ip_protocol": "tcp",
                "from_port": 443,
                "to_port": 443,
                "cidr": "10.1.0.0/16"
            })))
            .await
            .unwrap();
        assert_eq!(created.parent_group_id, "g1");
        assert_eq!(created.ip_range.cidr.as_deref(), Some("10.1.0.0/16"));
        assert_eq!(created.group, RuleGroupRef::default());
        assert_eq!(fx.repo.get("g1").await.unwrap().unwrap().rules.len(), 1);

        let err = fx
            .service
            .create_rule(new_rule(serde_json::json!({
                "parent_group_id": "g1",
                "ip_protocol": "tcp",
                "from_port": 443,
                "to_port": 443,
                "cidr": "10.1.0.0/16"
            })))
            .await
            .unwrap_err();
        assert_eq!(
            bad_request_message(err),
            "This rule already exists in group g1"
        );

        let err = fx
            .service
            .create_rule(new_rule(serde_json::json!({
                "parent_group_id": "g1", "cidr": "10.0.0.0/8"
            })))
            .await
            .unwrap_err();
        assert_eq!(
            bad_request_message(err),
            "Not enough parameters to build a valid rule."
        );
    }

    #[tokio::test]
    async fn test_create_rule_from_group() {
        let fx = fixture();
        fx.repo.create(group("g1", "web", "p1", vec![])).await.unwrap();
        fx.repo.create(group("g2", "db", "p2", vec![])).await.unwrap();

        let created = fx
            .service
            .create_rule(new_rule(serde_json::json!({
                "parent_group_id": "g1", "group_id": "g2"
            })))
            .await
            .unwrap();
        assert_eq!(
            created.group,
            RuleGroupRef {
                name: Some("db".into()),
                tenant_id: Some("p2".into()),
            }
        );
        assert_eq!(created.ip_range, IpRange::default());

        let err = fx
            .service
            .create_rule(new_rule(serde_json::json!({
                "parent_group_id": "g1", "group_id": "gone"
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));

        let err = fx
            .service
            .create_rule(new_rule(serde_json::json!({
                "parent_group_id": "missing", "group_id": "g2"
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_rule_quota() {
        let fx = fixture_with(ControlPlaneConfig {
            security_group_rule_quota: 1,
            ..Default::default()
        });
        fx.repo
            .create(group("g1", "web", "p1", vec![rule("r1", "g1", None)]))
            .await
            .unwrap();

        let err = fx
            .service
            .create_rule(new_rule(serde_json::json!({
                "parent_group_id": "g1", "ip_protocol": "udp", "cidr": "10.0.0.0/8"
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_delete_rule() {
        let fx = fixture();
        fx.repo
            .create(group(
                "g1",
                "web",
                "p1",
                vec![rule("r1", "g1", None), rule("r2", "g1", Some("g1"))],
            ))
            .await
            .unwrap();

        fx.service.delete_rule("r1").await.unwrap();
        let rules = fx.repo.get("g1").await.unwrap().unwrap().rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r2");

        let err = fx.service.delete_rule("r1").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(message) if message == "Rule (r1) not found."));
    }

    #[tokio::test]
    async fn test_delete_rule_with_ambiguous_id() {
        let fx = fixture();
        fx.repo
            .create(group("g1", "web", "p1", vec![rule("dup", "g1", None)]))
            .await
            .unwrap();
        fx.repo
            .create(group("g2", "db", "p1", vec![rule("dup", "g2", None)]))
            .await
            .unwrap();

        let err = fx.service.delete_rule("dup").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Conflict(_)));
        assert_eq!(fx.repo.get("g1").await.unwrap().unwrap().rules.len(), 1);
    }

    #[tokio::test]
    async fn test_add_and_remove_instance_group() {
        let fx = fixture();
        add_instance(&fx, "i1", "p1").await;
        fx.repo.create(group("g1", "web", "p1", vec![])).await.unwrap();
        fx.repo.create(group("g9", "web", "p9", vec![])).await.unwrap();

        fx.service.add_to_instance("i1", "web").await.unwrap();
        assert_eq!(fx.repo.instances_using("g1").await.unwrap(), vec!["i1"]);
        assert!(fx.repo.instances_using("g9").await.unwrap().is_empty());

        let err = fx.service.add_to_instance("i1", "g1").await.unwrap_err();
        assert!(bad_request_message(err).contains("already associated"));

        fx.service.remove_from_instance("i1", "g1").await.unwrap();
        let err = fx.service.remove_from_instance("i1", "web").await.unwrap_err();
        assert!(bad_request_message(err).contains("not associated"));
    }

    #[tokio::test]
    async fn test_instance_group_lookup_errors() {
        let fx = fixture();
        add_instance(&fx, "i1", "p1").await;
        fx.repo.create(group("g1", "web", "p1", vec![])).await.unwrap();
        fx.repo.create(group("g2", "web", "p1", vec![])).await.unwrap();

        let err = fx.service.add_to_instance("i1", "web").await.unwrap_err();
        assert!(matches!(
            err,
            ControlPlaneError::Conflict(message) if message.contains("Use an ID to be more specific")
        ));

        // An id is always unambiguous.
        fx.service.add_to_instance("i1", "g2").await.unwrap();

        let err = fx.service.add_to_instance("i1", "db").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));

        let err = fx.service.add_to_instance("missing", "g1").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    proptest! {
        #[test]
        fn prop_self_references_cost_no_lookups(rule_count in 0usize..64) {
            tokio_test::block_on(async {
                let fx = fixture();
                let rules = (0..rule_count)
                    .map(|i| rule(&format!("r{i}"), "g1", Some("g1")))
                    .collect();
                fx.repo.create(group("g1", "web", "p1", rules)).await.unwrap();

                let listed = fx.service.list("p1", page()).await.unwrap();
                assert_eq!(listed[0].rules.len(), rule_count);
                assert_eq!(fx.repo.lookups(), 0);
            });
        }
    }
}
