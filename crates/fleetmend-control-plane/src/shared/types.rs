pub use fleetmend_core::{
    ApiVersion, CellId, CellMapping, Instance, LockedBy, MinimumVersion, SecurityGroup,
    SecurityGroupRule, ServerGroup, ServerGroupPolicy, ServerGroupRules, ServiceVersion, VmState,
};

use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

/// Service class reported by compute nodes.
pub const COMPUTE_SERVICE: &str = "compute-node";

/// Identity and protocol version of the caller of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub project_id: String,
    pub user_id: String,
    pub is_admin: bool,
    pub api_version: ApiVersion,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            is_admin: false,
            api_version: ApiVersion::MIN,
        }
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn with_version(mut self, api_version: ApiVersion) -> Self {
        self.api_version = api_version;
        self
    }
}

/// A boolean that callers may also send as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlexibleBool {
    Bool(bool),
    Text(String),
}

impl FlexibleBool {
    /// Strict parse: anything other than a recognised spelling is an error.
    pub fn to_bool(&self, field: &str) -> ControlPlaneResult<bool> {
        match self {
            FlexibleBool::Bool(value) => Ok(*value),
            FlexibleBool::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "t" | "true" | "on" | "y" | "yes" => Ok(true),
                "0" | "f" | "false" | "off" | "n" | "no" => Ok(false),
                _ => Err(ControlPlaneError::BadRequest(format!(
                    "Invalid value for {field}: {text:?}"
                ))),
            },
        }
    }
}

/// Body of `POST /servers/{id}/action`.
///
/// Double options tell `{"lock": null}` (present, no body) apart from an
/// absent key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerActionBody {
    pub evacuate: Option<EvacuateBody>,
    #[serde(default, deserialize_with = "present")]
    pub lock: Option<Option<LockBody>>,
    #[serde(default, deserialize_with = "present")]
    pub unlock: Option<Option<IgnoredAny>>,
    #[serde(rename = "os-resetState")]
    pub reset_state: Option<ResetStateBody>,
    #[serde(rename = "injectNetworkInfo", default, deserialize_with = "present")]
    pub inject_network_info: Option<Option<IgnoredAny>>,
    #[serde(rename = "resetNetwork", default, deserialize_with = "present")]
    pub reset_network: Option<Option<IgnoredAny>>,
    #[serde(rename = "addSecurityGroup", default, deserialize_with = "present")]
    pub add_security_group: Option<Option<SecurityGroupActionBody>>,
    #[serde(rename = "removeSecurityGroup", default, deserialize_with = "present")]
    pub remove_security_group: Option<Option<SecurityGroupActionBody>>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LockBody {
    pub locked_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetStateBody {
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityGroupActionBody {
    pub name: Option<String>,
}

/// Longest lock reason accepted.
pub const MAX_LOCK_REASON_LEN: usize = 255;

/// One validated server action.
#[derive(Debug, Clone)]
pub enum ServerAction {
    Evacuate(EvacuateBody),
    Lock { reason: Option<String> },
    Unlock,
    ResetState(VmState),
    InjectNetworkInfo,
    ResetNetwork,
    AddSecurityGroup(String),
    RemoveSecurityGroup(String),
}

impl ServerAction {
    pub fn name(&self) -> &'static str {
        match self {
            ServerAction::Evacuate(_) => "evacuate",
            ServerAction::Lock { .. } => "lock",
            ServerAction::Unlock => "unlock",
            ServerAction::ResetState(_) => "os-resetState",
            ServerAction::InjectNetworkInfo => "injectNetworkInfo",
            ServerAction::ResetNetwork => "resetNetwork",
            ServerAction::AddSecurityGroup(_) => "addSecurityGroup",
            ServerAction::RemoveSecurityGroup(_) => "removeSecurityGroup",
        }
    }

    /// Picks the single action named in `body` and validates its arguments
    /// for `api_version`.
    pub fn from_body(body: ServerActionBody, api_version: ApiVersion) -> ControlPlaneResult<Self> {
        let mut actions = Vec::new();

        if let Some(evacuate) = body.evacuate {
            actions.push(ServerAction::Evacuate(evacuate));
        }
        if let Some(lock) = body.lock {
            let reason = lock.and_then(|lock| lock.locked_reason);
            if reason.is_some() && !api_version.is_at_least(ApiVersion::LOCK_REASON) {
                return Err(ControlPlaneError::BadRequest(
                    "Additional properties are not allowed ('locked_reason' was unexpected)"
                        .to_string(),
                ));
            }
            if reason
                .as_ref()
                .is_some_and(|reason| reason.chars().count() > MAX_LOCK_REASON_LEN)
            {
                return Err(ControlPlaneError::BadRequest(format!(
                    "Invalid input for field/attribute locked_reason. \
                     Value is longer than {MAX_LOCK_REASON_LEN} characters."
                )));
            }
            actions.push(ServerAction::Lock { reason });
        }
        if body.unlock.is_some() {
            actions.push(ServerAction::Unlock);
        }
        if let Some(reset) = body.reset_state {
            let state = match reset.state.as_str() {
                "active" => VmState::Active,
                "error" => VmState::Error,
                other => {
                    return Err(ControlPlaneError::BadRequest(format!(
                        "Invalid input for field/attribute state. \
                         Value: {other}. '{other}' is not one of ['active', 'error']"
                    )))
                }
            };
            actions.push(ServerAction::ResetState(state));
        }
        if body.inject_network_info.is_some() {
            actions.push(ServerAction::InjectNetworkInfo);
        }
        if body.reset_network.is_some() {
            actions.push(ServerAction::ResetNetwork);
        }
        if let Some(add) = body.add_security_group {
            actions.push(ServerAction::AddSecurityGroup(security_group_name(add)?));
        }
        if let Some(remove) = body.remove_security_group {
            actions.push(ServerAction::RemoveSecurityGroup(security_group_name(remove)?));
        }

        match actions.len() {
            0 => Err(ControlPlaneError::BadRequest(
                "Unsupported server action".to_string(),
            )),
            1 => Ok(actions.remove(0)),
            _ => Err(ControlPlaneError::BadRequest(
                "Only one server action may be requested at a time".to_string(),
            )),
        }
    }
}

fn security_group_name(body: Option<SecurityGroupActionBody>) -> ControlPlaneResult<String> {
    let body = body
        .ok_or_else(|| ControlPlaneError::BadRequest("Missing parameter dict".to_string()))?;
    let name = body.name.ok_or_else(|| {
        ControlPlaneError::BadRequest("Security group not specified".to_string())
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ControlPlaneError::BadRequest(
            "Security group name cannot be empty".to_string(),
        ));
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvacuateBody {
    pub host: Option<String>,
    pub force: Option<FlexibleBool>,
    #[serde(rename = "adminPass")]
    pub admin_pass: Option<String>,
    #[serde(rename = "onSharedStorage")]
    pub on_shared_storage: Option<FlexibleBool>,
}

/// How the post-relocation admin credential is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    Legacy { on_shared_storage: bool },
    Modern,
}

/// One relocation request, built per call and dropped after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationRequest {
    pub instance_id: String,
    pub target_host: Option<String>,
    pub force: bool,
    pub supplied_credential: Option<String>,
    pub credential_mode: CredentialMode,
    /// Leave the instance stopped at its new host.
    pub stopped_target: bool,
}

impl RelocationRequest {
    pub fn from_body(
        instance_id: impl Into<String>,
        body: EvacuateBody,
        api_version: ApiVersion,
    ) -> ControlPlaneResult<Self> {
        let credential_mode = if api_version.is_at_least(ApiVersion::RELOCATE_MODERN_CREDENTIAL) {
            CredentialMode::Modern
        } else {
            let on_shared_storage = body
                .on_shared_storage
                .as_ref()
                .ok_or_else(|| {
                    ControlPlaneError::BadRequest(
                        "onSharedStorage is required for this API version".to_string(),
                    )
                })?
                .to_bool("onSharedStorage")?;
            CredentialMode::Legacy { on_shared_storage }
        };

        let force = if api_version.is_at_least(ApiVersion::RELOCATE_FORCE) {
            match &body.force {
                Some(force) => force.to_bool("force")?,
                None => false,
            }
        } else {
            false
        };

        Ok(Self {
            instance_id: instance_id.into(),
            target_host: body
                .host
                .map(|host| host.trim().to_string())
                .filter(|host| !host.is_empty()),
            force,
            supplied_credential: body.admin_pass,
            credential_mode,
            stopped_target: api_version.is_at_least(ApiVersion::RELOCATE_STOPPED_TARGET),
        })
    }
}

/// Everything the compute subsystem needs to carry out a relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationDispatch {
    pub instance: Instance,
    pub host: Option<String>,
    pub on_shared_storage: Option<bool>,
    pub credential: Option<String>,
    pub force: bool,
    pub target_state: Option<VmState>,
}

/// Response body of an accepted relocation, when one is returned at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateResponse {
    #[serde(rename = "adminPass")]
    pub admin_pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    Project(String),
    AllProjects,
}

/// Offset/limit window over a sorted listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn from_query(
        limit: Option<i64>,
        offset: Option<i64>,
        max_limit: usize,
    ) -> ControlPlaneResult<Self> {
        let offset = match offset {
            None => 0,
            Some(value) if value < 0 => {
                return Err(ControlPlaneError::BadRequest(
                    "offset param must be positive".to_string(),
                ))
            }
            Some(value) => value as usize,
        };

        let limit = match limit {
            None | Some(0) => max_limit,
            Some(value) if value < 0 => {
                return Err(ControlPlaneError::BadRequest(
                    "limit param must be positive".to_string(),
                ))
            }
            Some(value) => (value as usize).min(max_limit),
        };

        Ok(Self { offset, limit })
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerGroupListQuery {
    pub all_projects: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerGroupBody {
    pub server_group: NewServerGroup,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewServerGroup {
    pub name: String,
    pub policy: Option<String>,
    pub policies: Option<Vec<String>>,
    pub rules: Option<ServerGroupRules>,
}

/// Server group as shown to a caller at a given API version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedServerGroup {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<ServerGroupPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<ServerGroupRules>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies: Option<Vec<ServerGroupPolicy>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub members: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroupList {
    pub server_groups: Vec<FormattedServerGroup>,
}

/// Reference from a rule to another security group; empty when the rule is CIDR based.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroupRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedSecurityGroupRule {
    pub id: String,
    pub parent_group_id: String,
    pub ip_protocol: Option<String>,
    pub from_port: Option<i32>,
    pub to_port: Option<i32>,
    pub group: RuleGroupRef,
    pub ip_range: IpRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedSecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tenant_id: String,
    pub rules: Vec<FormattedSecurityGroupRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupList {
    pub security_groups: Vec<FormattedSecurityGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupResponse {
    pub security_group: FormattedSecurityGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRuleResponse {
    pub security_group_rule: FormattedSecurityGroupRule,
}

/// Body of security group create and update.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroupBody {
    pub security_group: Option<SecurityGroupFields>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityGroupFields {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSecurityGroupRuleBody {
    pub security_group_rule: Option<NewSecurityGroupRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSecurityGroupRule {
    pub parent_group_id: Option<String>,
    pub ip_protocol: Option<String>,
    pub from_port: Option<PortValue>,
    pub to_port: Option<PortValue>,
    pub cidr: Option<String>,
    pub group_id: Option<String>,
}

/// A port that callers may send as a number or a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    pub fn to_port(&self) -> Option<i32> {
        match self {
            PortValue::Number(value) => i32::try_from(*value).ok(),
            PortValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: serde_json::Value) -> EvacuateBody {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_flexible_bool_strict() {
        assert!(FlexibleBool::Bool(true).to_bool("force").unwrap());
        assert!(FlexibleBool::Text("True".into()).to_bool("force").unwrap());
        assert!(!FlexibleBool::Text("off".into()).to_bool("force").unwrap());
        assert!(FlexibleBool::Text("sure".into()).to_bool("force").is_err());
    }

    #[test]
    fn test_legacy_request_requires_shared_storage_flag() {
        let result = RelocationRequest::from_body(
            "inst-1",
            body(serde_json::json!({"host": "hostB"})),
            ApiVersion::new(2, 1),
        );
        assert!(matches!(result, Err(ControlPlaneError::BadRequest(_))));
    }

    #[test]
    fn test_legacy_request_parses_shared_storage() {
        let request = RelocationRequest::from_body(
            "inst-1",
            body(serde_json::json!({"host": "hostB", "onSharedStorage": "True"})),
            ApiVersion::new(2, 13),
        )
        .unwrap();
        assert_eq!(
            request.credential_mode,
            CredentialMode::Legacy {
                on_shared_storage: true
            }
        );
        assert!(!request.stopped_target);
    }

    #[test]
    fn test_force_ignored_before_it_was_introduced() {
        let request = RelocationRequest::from_body(
            "inst-1",
            body(serde_json::json!({"force": true})),
            ApiVersion::new(2, 28),
        )
        .unwrap();
        assert!(!request.force);
        assert_eq!(request.credential_mode, CredentialMode::Modern);
    }

    #[test]
    fn test_force_and_stopped_target_on_latest() {
        let request = RelocationRequest::from_body(
            "inst-1",
            body(serde_json::json!({"host": "hostB", "force": "true"})),
            ApiVersion::MAX,
        )
        .unwrap();
        assert!(request.force);
        assert!(request.stopped_target);
        assert_eq!(request.target_host.as_deref(), Some("hostB"));
    }

    #[test]
    fn test_blank_host_means_no_destination() {
        for host in ["", "   "] {
            let request = RelocationRequest::from_body(
                "inst-1",
                body(serde_json::json!({"host": host, "force": true})),
                ApiVersion::MAX,
            )
            .unwrap();
            assert!(request.target_host.is_none());
            assert!(request.force);
        }
    }

    fn action(json: serde_json::Value, version: ApiVersion) -> ControlPlaneResult<ServerAction> {
        let body: ServerActionBody = serde_json::from_value(json).unwrap();
        ServerAction::from_body(body, version)
    }

    fn bad_request(result: ControlPlaneResult<ServerAction>) -> String {
        match result {
            Err(ControlPlaneError::BadRequest(message)) => message,
            other => panic!("expected a bad request, got {other:?}"),
        }
    }

    #[test]
    fn test_null_action_bodies_are_present() {
        let parsed = action(serde_json::json!({"unlock": null}), ApiVersion::MIN).unwrap();
        assert!(matches!(parsed, ServerAction::Unlock));

        let parsed = action(serde_json::json!({"lock": null}), ApiVersion::MIN).unwrap();
        assert!(matches!(parsed, ServerAction::Lock { reason: None }));

        let parsed = action(serde_json::json!({"resetNetwork": null}), ApiVersion::MIN).unwrap();
        assert_eq!(parsed.name(), "resetNetwork");
    }

    #[test]
    fn test_unknown_or_multiple_actions_rejected() {
        let message = bad_request(action(serde_json::json!({"reboot": {}}), ApiVersion::MIN));
        assert_eq!(message, "Unsupported server action");

        let message = bad_request(action(
            serde_json::json!({"lock": null, "unlock": null}),
            ApiVersion::MIN,
        ));
        assert!(message.contains("Only one"));
    }

    #[test]
    fn test_lock_reason_needs_recent_version() {
        let json = serde_json::json!({"lock": {"locked_reason": "maintenance"}});
        let message = bad_request(action(json.clone(), ApiVersion::new(2, 72)));
        assert!(message.contains("locked_reason"));

        match action(json, ApiVersion::LOCK_REASON).unwrap() {
            ServerAction::Lock { reason } => assert_eq!(reason.as_deref(), Some("maintenance")),
            other => panic!("unexpected action {other:?}"),
        }

        let long = "x".repeat(MAX_LOCK_REASON_LEN + 1);
        let json = serde_json::json!({"lock": {"locked_reason": long}});
        assert!(bad_request(action(json, ApiVersion::MAX)).contains("longer than"));
    }

    #[test]
    fn test_reset_state_accepts_active_or_error() {
        let parsed = action(
            serde_json::json!({"os-resetState": {"state": "error"}}),
            ApiVersion::MIN,
        )
        .unwrap();
        assert!(matches!(parsed, ServerAction::ResetState(VmState::Error)));

        let message = bad_request(action(
            serde_json::json!({"os-resetState": {"state": "stopped"}}),
            ApiVersion::MIN,
        ));
        assert!(message.contains("state"));
    }

    #[test]
    fn test_security_group_action_names() {
        let parsed = action(
            serde_json::json!({"addSecurityGroup": {"name": "  web "}}),
            ApiVersion::MIN,
        )
        .unwrap();
        assert!(matches!(parsed, ServerAction::AddSecurityGroup(name) if name == "web"));

        let message = bad_request(action(
            serde_json::json!({"removeSecurityGroup": {"name": "   "}}),
            ApiVersion::MIN,
        ));
        assert_eq!(message, "Security group name cannot be empty");

        let message = bad_request(action(
            serde_json::json!({"addSecurityGroup": {}}),
            ApiVersion::MIN,
        ));
        assert_eq!(message, "Security group not specified");

        let message = bad_request(action(
            serde_json::json!({"addSecurityGroup": null}),
            ApiVersion::MIN,
        ));
        assert_eq!(message, "Missing parameter dict");
    }

    #[test]
    fn test_port_value_accepts_numeric_strings() {
        let port: PortValue = serde_json::from_value(serde_json::json!("443")).unwrap();
        assert_eq!(port.to_port(), Some(443));
        let port: PortValue = serde_json::from_value(serde_json::json!(-1)).unwrap();
        assert_eq!(port.to_port(), Some(-1));
        let port: PortValue = serde_json::from_value(serde_json::json!("ssh")).unwrap();
        assert_eq!(port.to_port(), None);
    }

    #[test]
    fn test_page_defaults_and_caps() {
        let page = Page::from_query(None, None, 1000).unwrap();
        assert_eq!(page, Page { offset: 0, limit: 1000 });

        let page = Page::from_query(Some(5000), Some(2), 1000).unwrap();
        assert_eq!(page, Page { offset: 2, limit: 1000 });

        let page = Page::from_query(Some(0), None, 50).unwrap();
        assert_eq!(page.limit, 50);

        assert!(Page::from_query(Some(-1), None, 10).is_err());
        assert!(Page::from_query(None, Some(-3), 10).is_err());
    }

    #[test]
    fn test_page_apply() {
        let page = Page { offset: 1, limit: 2 };
        assert_eq!(page.apply(vec![1, 2, 3, 4]), vec![2, 3]);
        let page = Page { offset: 10, limit: 2 };
        assert!(page.apply(vec![1, 2, 3]).is_empty());
    }

    #[test]
    fn test_empty_rule_refs_serialize_as_empty_objects() {
        let rule = FormattedSecurityGroupRule {
            id: "r1".into(),
            parent_group_id: "g1".into(),
            ip_protocol: Some("tcp".into()),
            from_port: Some(22),
            to_port: Some(22),
            group: RuleGroupRef::default(),
            ip_range: IpRange {
                cidr: Some("10.0.0.0/8".into()),
            },
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["group"], serde_json::json!({}));
        assert_eq!(json["ip_range"], serde_json::json!({"cidr": "10.0.0.0/8"}));
    }
}
