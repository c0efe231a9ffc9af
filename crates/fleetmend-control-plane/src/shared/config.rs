use fleetmend_core::credential::DEFAULT_PASSWORD_LENGTH;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// What to do when one cell cannot be queried during a fleet-wide read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFailurePolicy {
    /// Fail the whole request.
    #[default]
    FailClosed,
    /// Leave the cell out of the result and carry on.
    Degrade,
}

impl FromStr for PartitionFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_closed" => Ok(PartitionFailurePolicy::FailClosed),
            "degrade" => Ok(PartitionFailurePolicy::Degrade),
            other => Err(format!("expected fail_closed or degrade, got {other}")),
        }
    }
}

/// Process-lifetime configuration handed to every service at construction.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub listen_addr: SocketAddr,
    pub enable_instance_password: bool,
    pub password_length: usize,
    pub cell_worker_pool_size: usize,
    pub partition_failure_policy: PartitionFailurePolicy,
    /// Negative means unlimited.
    pub server_group_quota: i64,
    /// Per project. Negative means unlimited.
    pub security_group_quota: i64,
    /// Per security group. Negative means unlimited.
    pub security_group_rule_quota: i64,
    pub recheck_quota: bool,
    pub max_list_limit: usize,
    pub seed_file: Option<PathBuf>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8774)),
            enable_instance_password: true,
            password_length: DEFAULT_PASSWORD_LENGTH,
            cell_worker_pool_size: 5,
            partition_failure_policy: PartitionFailurePolicy::FailClosed,
            server_group_quota: 10,
            security_group_quota: 10,
            security_group_rule_quota: 20,
            recheck_quota: true,
            max_list_limit: 1000,
            seed_file: None,
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            listen_addr: parse_or("FLEETMEND_LISTEN_ADDR", &lookup, defaults.listen_addr)?,
            enable_instance_password: parse_bool_or(
                "FLEETMEND_ENABLE_INSTANCE_PASSWORD",
                &lookup,
                defaults.enable_instance_password,
            )?,
            password_length: parse_or(
                "FLEETMEND_PASSWORD_LENGTH",
                &lookup,
                defaults.password_length,
            )?,
            cell_worker_pool_size: parse_or(
                "FLEETMEND_CELL_WORKER_POOL_SIZE",
                &lookup,
                defaults.cell_worker_pool_size,
            )?,
            partition_failure_policy: parse_or(
                "FLEETMEND_PARTITION_FAILURE_POLICY",
                &lookup,
                defaults.partition_failure_policy,
            )?,
            server_group_quota: parse_or(
                "FLEETMEND_SERVER_GROUP_QUOTA",
                &lookup,
                defaults.server_group_quota,
            )?,
            security_group_quota: parse_or(
                "FLEETMEND_SECURITY_GROUP_QUOTA",
                &lookup,
                defaults.security_group_quota,
            )?,
            security_group_rule_quota: parse_or(
                "FLEETMEND_SECURITY_GROUP_RULE_QUOTA",
                &lookup,
                defaults.security_group_rule_quota,
            )?,
            recheck_quota: parse_bool_or("FLEETMEND_RECHECK_QUOTA", &lookup, defaults.recheck_quota)?,
            max_list_limit: parse_or("FLEETMEND_MAX_LIST_LIMIT", &lookup, defaults.max_list_limit)?,
            seed_file: lookup("FLEETMEND_SEED_FILE")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cell_worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FLEETMEND_CELL_WORKER_POOL_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.max_list_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FLEETMEND_MAX_LIST_LIMIT",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_or<T, F>(key: &'static str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_bool_or<F>(key: &'static str, lookup: &F, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}
