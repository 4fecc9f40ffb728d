//! Persisted records: hosts and the domains provisioned on them.

use serde::{Deserialize, Serialize};
use vmscale_core::{HostConfig, HypervisorKind, Protocol, Resources};

/// Provisioned-state mirror of a configured host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRecord {
    pub name: String,
    pub address: String,
    pub protocol: Protocol,
    pub port: u16,
    pub hypervisor: HypervisorKind,
    pub user: Option<String>,
    /// Declared capacity.
    pub resources: Resources,
    /// Last known power state of the host itself.
    pub powered: bool,
    /// Unix timestamp of the last successful operation against the host.
    pub updated_at: u64,
}

impl HostRecord {
    pub fn from_config(host: &HostConfig, now: u64) -> Self {
        Self {
            name: host.name.clone(),
            address: host.address.clone(),
            protocol: host.protocol,
            port: host.port,
            hypervisor: host.hypervisor,
            user: host.user.clone(),
            resources: host.resources,
            powered: true,
            updated_at: now,
        }
    }

    /// Connection parameters in config form, for the drivers.
    pub fn to_config(&self) -> HostConfig {
        HostConfig {
            name: self.name.clone(),
            address: self.address.clone(),
            protocol: self.protocol,
            port: self.port,
            hypervisor: self.hypervisor,
            user: self.user.clone(),
            resources: self.resources,
        }
    }
}

/// Lifecycle state of a domain.
///
/// `Provisioning`, `Migrating` and `Deleting` only last while the executor
/// has the matching driver call in progress. A deleted domain has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Provisioning,
    Running,
    Stopped,
    Migrating,
    Deleting,
}

impl DomainState {
    /// Counts towards the group's provisioned size.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Deleting)
    }
}

/// A VM owned by an autoscaling group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainRecord {
    pub name: String,
    pub host: String,
    pub group: String,
    pub image: String,
    pub resources: Resources,
    pub state: DomainState,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DomainRecord {
    /// Build the composite key for the domains table.
    pub fn table_key(&self) -> String {
        domain_key(&self.group, &self.name)
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_running(&self) -> bool {
        self.state == DomainState::Running
    }
}

pub fn domain_key(group: &str, name: &str) -> String {
    format!("{group}:{name}")
}

pub fn member_key(group: &str, host: &str) -> String {
    format!("{group}/{host}")
}
