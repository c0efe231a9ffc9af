use crate::shared::error::ControlPlaneResult;
use crate::shared::types::SecurityGroup;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Repository trait for security group storage
#[async_trait]
pub trait SecurityGroupRepository: Send + Sync {
    async fn get(&self, group_id: &str) -> ControlPlaneResult<Option<SecurityGroup>>;

    async fn list_by_project(&self, project_id: &str) -> ControlPlaneResult<Vec<SecurityGroup>>;

    /// Groups attached to an instance. Attachments to deleted groups are skipped.
    async fn list_for_instance(&self, instance_id: &str)
        -> ControlPlaneResult<Vec<SecurityGroup>>;

    async fn create(&self, group: SecurityGroup) -> ControlPlaneResult<()>;

    /// Replaces a stored group. Returns false when it no longer exists.
    async fn update(&self, group: SecurityGroup) -> ControlPlaneResult<bool>;

    /// Removes a group and its attachments. Rules in other groups that
    /// reference it are left as they are.
    async fn delete(&self, group_id: &str) -> ControlPlaneResult<bool>;

    async fn count_by_project(&self, project_id: &str) -> ControlPlaneResult<usize>;

    /// Groups in `project_id` whose id or name equals `name_or_id`.
    async fn find_by_name_or_id(
        &self,
        project_id: &str,
        name_or_id: &str,
    ) -> ControlPlaneResult<Vec<SecurityGroup>>;

    /// Groups holding a rule with this id.
    async fn find_rule_parents(&self, rule_id: &str) -> ControlPlaneResult<Vec<SecurityGroup>>;

    /// Returns false when the group was already attached.
    async fn attach(&self, instance_id: &str, group_id: &str) -> ControlPlaneResult<bool>;

    /// Returns false when the group was not attached.
    async fn detach(&self, instance_id: &str, group_id: &str) -> ControlPlaneResult<bool>;

    /// Instances the group is attached to.
    async fn instances_using(&self, group_id: &str) -> ControlPlaneResult<Vec<String>>;
}

/// In-memory implementation of security group repository
#[derive(Clone, Default)]
pub struct InMemorySecurityGroupRepository {
    groups: Arc<RwLock<HashMap<String, SecurityGroup>>>,
    attachments: Arc<RwLock<HashMap<String, Vec<String>>>>,
    lookups: Arc<AtomicUsize>,
}

impl InMemorySecurityGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of single-group lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecurityGroupRepository for InMemorySecurityGroupRepository {
    async fn get(&self, group_id: &str) -> ControlPlaneResult<Option<SecurityGroup>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let groups = self.groups.read().await;
        Ok(groups.get(group_id).cloned())
    }

    async fn list_by_project(&self, project_id: &str) -> ControlPlaneResult<Vec<SecurityGroup>> {
        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .filter(|group| group.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_for_instance(
        &self,
        instance_id: &str,
    ) -> ControlPlaneResult<Vec<SecurityGroup>> {
        let attachments = self.attachments.read().await;
        let groups = self.groups.read().await;
        Ok(attachments
            .get(instance_id)
            .map(|ids| ids.iter().filter_map(|id| groups.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn create(&self, group: SecurityGroup) -> ControlPlaneResult<()> {
        let mut groups = self.groups.write().await;
        groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn update(&self, group: SecurityGroup) -> ControlPlaneResult<bool> {
        let mut groups = self.groups.write().await;
        match groups.get_mut(&group.id) {
            Some(stored) => {
                *stored = group;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, group_id: &str) -> ControlPlaneResult<bool> {
        let removed = self.groups.write().await.remove(group_id).is_some();
        if removed {
            let mut attachments = self.attachments.write().await;
            for ids in attachments.values_mut() {
                ids.retain(|id| id != group_id);
            }
        }
        Ok(removed)
    }

    async fn count_by_project(&self, project_id: &str) -> ControlPlaneResult<usize> {
        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .filter(|group| group.project_id == project_id)
            .count())
    }

    async fn find_by_name_or_id(
        &self,
        project_id: &str,
        name_or_id: &str,
    ) -> ControlPlaneResult<Vec<SecurityGroup>> {
        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .filter(|group| group.project_id == project_id)
            .filter(|group| group.id == name_or_id || group.name == name_or_id)
            .cloned()
            .collect())
    }

    async fn find_rule_parents(&self, rule_id: &str) -> ControlPlaneResult<Vec<SecurityGroup>> {
        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .filter(|group| group.rules.iter().any(|rule| rule.id == rule_id))
            .cloned()
            .collect())
    }

    async fn attach(&self, instance_id: &str, group_id: &str) -> ControlPlaneResult<bool> {
        let mut attachments = self.attachments.write().await;
        let ids = attachments.entry(instance_id.to_string()).or_default();
        if ids.iter().any(|id| id == group_id) {
            return Ok(false);
        }
        ids.push(group_id.to_string());
        Ok(true)
    }

    async fn detach(&self, instance_id: &str, group_id: &str) -> ControlPlaneResult<bool> {
        let mut attachments = self.attachments.write().await;
        let Some(ids) = attachments.get_mut(instance_id) else {
            return Ok(false);
        };
        let before = ids.len();
        ids.retain(|id| id != group_id);
        Ok(ids.len() != before)
    }

    async fn instances_using(&self, group_id: &str) -> ControlPlaneResult<Vec<String>> {
        let attachments = self.attachments.read().await;
        let mut instances: Vec<String> = attachments
            .iter()
            .filter(|(_, ids)| ids.iter().any(|id| id == group_id))
            .map(|(instance_id, _)| instance_id.clone())
            .collect();
        instances.sort();
        Ok(instances)
    }
}
