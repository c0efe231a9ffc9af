pub mod credential;
pub mod version;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub use version::{ApiVersion, MinimumVersion, ServiceVersion};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid API version: {0}")]
    InvalidApiVersion(String),
    #[error("API version not supported: {0}")]
    UnsupportedApiVersion(String),
    #[error("Invalid server group policy: {0}")]
    InvalidPolicy(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Identifier of a cell, an independently stored shard of instance records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellMapping {
    pub id: CellId,
    pub name: String,
}

impl CellMapping {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: CellId::new(id),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Active,
    Building,
    Paused,
    Suspended,
    Stopped,
    Rescued,
    Resized,
    Shelved,
    ShelvedOffloaded,
    Error,
    Deleted,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Active => "active",
            VmState::Building => "building",
            VmState::Paused => "paused",
            VmState::Suspended => "suspended",
            VmState::Stopped => "stopped",
            VmState::Rescued => "rescued",
            VmState::Resized => "resized",
            VmState::Shelved => "shelved",
            VmState::ShelvedOffloaded => "shelved_offloaded",
            VmState::Error => "error",
            VmState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload unit as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub host: Option<String>,
    pub vm_state: VmState,
    #[serde(default)]
    pub task_state: Option<String>,
    #[serde(default)]
    pub cell_id: Option<CellId>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub locked_by: Option<LockedBy>,
    #[serde(default)]
    pub locked_reason: Option<String>,
}

/// Who placed the lock on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockedBy {
    Owner,
    Admin,
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        host: Option<String>,
        vm_state: VmState,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            host,
            vm_state,
            task_state: None,
            cell_id: None,
            locked: false,
            locked_by: None,
            locked_reason: None,
        }
    }

    pub fn in_cell(mut self, cell_id: CellId) -> Self {
        self.cell_id = Some(cell_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerGroupPolicy {
    #[serde(rename = "affinity")]
    Affinity,
    #[serde(rename = "anti-affinity")]
    AntiAffinity,
    #[serde(rename = "soft-affinity")]
    SoftAffinity,
    #[serde(rename = "soft-anti-affinity")]
    SoftAntiAffinity,
}

impl ServerGroupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerGroupPolicy::Affinity => "affinity",
            ServerGroupPolicy::AntiAffinity => "anti-affinity",
            ServerGroupPolicy::SoftAffinity => "soft-affinity",
            ServerGroupPolicy::SoftAntiAffinity => "soft-anti-affinity",
        }
    }

    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            ServerGroupPolicy::SoftAffinity | ServerGroupPolicy::SoftAntiAffinity
        )
    }
}

impl std::str::FromStr for ServerGroupPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "affinity" => Ok(ServerGroupPolicy::Affinity),
            "anti-affinity" => Ok(ServerGroupPolicy::AntiAffinity),
            "soft-affinity" => Ok(ServerGroupPolicy::SoftAffinity),
            "soft-anti-affinity" => Ok(ServerGroupPolicy::SoftAntiAffinity),
            other => Err(CoreError::InvalidPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroupRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_server_per_host: Option<u32>,
}

impl ServerGroupRules {
    pub fn is_empty(&self) -> bool {
        self.max_server_per_host.is_none()
    }
}

/// A named collection of workloads placed under a scheduling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub policy: ServerGroupPolicy,
    #[serde(default)]
    pub rules: ServerGroupRules,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    pub parent_group_id: String,
    pub protocol: Option<String>,
    pub from_port: Option<i32>,
    pub to_port: Option<i32>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub cidr: Option<String>,
}

/// A named collection of network rules owned by a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub project_id: String,
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
}

/// Error envelope returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>, status: u16) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            status,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, String>) -> Self {
        self.details = Some(details);
        self
    }
}
