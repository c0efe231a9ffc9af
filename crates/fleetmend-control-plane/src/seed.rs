//! Fleet state loaded at startup into the in-memory backends.

use crate::features::host_resolution::repo::InMemoryHostMappingRepository;
use crate::features::instance_management::repo::{InMemoryInstanceRepository, InstanceRepository};
use crate::features::relocation::repo::InMemoryComputeApi;
use crate::features::security_groups::repo::{
    InMemorySecurityGroupRepository, SecurityGroupRepository,
};
use crate::features::server_groups::repo::{InMemoryServerGroupRepository, ServerGroupRepository};
use crate::features::version_registry::repo::{InMemoryServiceRepository, ServiceRecord};
use crate::shared::error::ControlPlaneError;
use crate::shared::types::{CellId, CellMapping, Instance, SecurityGroup, ServerGroup};
use crate::Backends;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse seed file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to load seed: {0}")]
    Store(#[from] ControlPlaneError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededService {
    pub cell: CellId,
    #[serde(flatten)]
    pub record: ServiceRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededHost {
    pub host: String,
    pub cell: CellId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededAttachment {
    pub instance_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSeed {
    #[serde(default)]
    pub cells: Vec<CellMapping>,
    #[serde(default)]
    pub services: Vec<SeededService>,
    #[serde(default)]
    pub hosts: Vec<SeededHost>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub server_groups: Vec<ServerGroup>,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroup>,
    #[serde(default)]
    pub security_group_attachments: Vec<SeededAttachment>,
}

impl FleetSeed {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// In-memory backends, kept concrete so callers can still mutate them.
#[derive(Clone, Default)]
pub struct InMemoryFleet {
    pub services: InMemoryServiceRepository,
    pub host_mappings: InMemoryHostMappingRepository,
    pub instances: InMemoryInstanceRepository,
    pub server_groups: InMemoryServerGroupRepository,
    pub security_groups: InMemorySecurityGroupRepository,
    pub compute: InMemoryComputeApi,
}

impl InMemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_seed(seed: FleetSeed) -> Result<Self, SeedError> {
        let fleet = Self::new();

        for cell in seed.cells {
            fleet.services.add_cell(cell).await;
        }
        for service in seed.services {
            fleet.services.add_service(&service.cell, service.record).await;
        }
        for host in seed.hosts {
            fleet.host_mappings.map_host(host.host, host.cell).await;
        }
        for instance in seed.instances {
            fleet.instances.upsert(instance).await?;
        }
        for group in seed.server_groups {
            fleet.server_groups.create(group).await?;
        }
        for group in seed.security_groups {
            fleet.security_groups.create(group).await?;
        }
        for attachment in seed.security_group_attachments {
            fleet
                .security_groups
                .attach(&attachment.instance_id, &attachment.group_id)
                .await?;
        }

        info!("Loaded fleet seed into in-memory backends");
        Ok(fleet)
    }

    pub fn backends(&self) -> Backends {
        Backends {
            services: Arc::new(self.services.clone()),
            host_mappings: Arc::new(self.host_mappings.clone()),
            instances: Arc::new(self.instances.clone()),
            server_groups: Arc::new(self.server_groups.clone()),
            security_groups: Arc::new(self.security_groups.clone()),
            compute: Arc::new(self.compute.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::host_resolution::repo::HostMappingRepository;
    use crate::features::version_registry::repo::ServiceRepository;

    #[tokio::test]
    async fn test_seed_populates_backends() {
        let seed: FleetSeed = serde_json::from_value(serde_json::json!({
            "cells": [{"id": "cell1", "name": "one"}],
            "services": [{"cell": "cell1", "host": "hostA", "binary": "compute-node", "version": 66}],
            "hosts": [{"host": "hostA", "cell": "cell1"}],
            "instances": [{
                "id": "i1", "project_id": "p1", "user_id": "u1",
                "host": "hostA", "vm_state": "active", "cell_id": "cell1"
            }],
            "server_groups": [{
                "id": "g1", "name": "web", "project_id": "p1", "user_id": "u1",
                "policy": "anti-affinity", "members": ["i1"]
            }]
        }))
        .unwrap();

        let fleet = InMemoryFleet::from_seed(seed).await.unwrap();

        assert_eq!(fleet.services.list_cells().await.unwrap().len(), 1);
        assert_eq!(
            fleet.host_mappings.get_cell_for_host("hostA").await.unwrap(),
            Some(CellId::new("cell1"))
        );
        assert!(fleet.instances.get("i1").await.unwrap().is_some());
        assert!(fleet.server_groups.get("g1").await.unwrap().is_some());
    }

    #[test]
    fn test_missing_seed_file() {
        let err = FleetSeed::load(Path::new("/nonexistent/fleet-seed.json")).unwrap_err();
        assert!(matches!(err, SeedError::Io(_)));
    }
}
