//! Action model: what the reconciler asks for and the executor performs.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use vmscale_core::epoch_secs;
use vmscale_hypervisor::VmSpec;

/// Deterministic action identity.
///
/// Two decisions with the same kind, target, payload and decision epoch get
/// the same id, which is what the queue deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    pub fn derive(kind: ActionKind, host: &str, group: &str, payload: &ActionPayload, epoch: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str());
        hasher.update([0u8]);
        hasher.update(host);
        hasher.update([0u8]);
        hasher.update(group);
        hasher.update([0u8]);
        // Struct serialization order is fixed, so this is stable.
        hasher.update(serde_json::to_vec(payload).unwrap_or_default());
        hasher.update([0u8]);
        hasher.update(epoch.to_be_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateVm,
    DeleteVm,
    MigrateVm,
    SetPower,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateVm => "create_vm",
            Self::DeleteVm => "delete_vm",
            Self::MigrateVm => "migrate_vm",
            Self::SetPower => "set_power",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActionPayload {
    Create { spec: VmSpec },
    Delete { domain: String },
    Migrate { domain: String, target_host: String },
    Power { domain: String, on: bool },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Create { .. } => ActionKind::CreateVm,
            Self::Delete { .. } => ActionKind::DeleteVm,
            Self::Migrate { .. } => ActionKind::MigrateVm,
            Self::Power { .. } => ActionKind::SetPower,
        }
    }

    /// Name of the domain the action touches.
    pub fn domain(&self) -> &str {
        match self {
            Self::Create { spec } => &spec.name,
            Self::Delete { domain }
            | Self::Migrate { domain, .. }
            | Self::Power { domain, .. } => domain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub payload: ActionPayload,
    /// Host the action runs against (the source host for migrations).
    pub host: String,
    pub group: String,
    pub state: ActionState,
    /// Transient failures so far.
    pub retries: u32,
    pub created_at: u64,
    /// Admission order, assigned by the queue.
    pub seq: u64,
}

impl Action {
    pub fn new(payload: ActionPayload, host: &str, group: &str, epoch: u64) -> Self {
        Self {
            id: ActionId::derive(payload.kind(), host, group, &payload, epoch),
            payload,
            host: host.to_string(),
            group: group.to_string(),
            state: ActionState::Pending,
            retries: 0,
            created_at: epoch_secs(),
            seq: 0,
        }
    }

    pub fn create(group: &str, host: &str, spec: VmSpec, epoch: u64) -> Self {
        Self::new(ActionPayload::Create { spec }, host, group, epoch)
    }

    pub fn delete(group: &str, host: &str, domain: &str, epoch: u64) -> Self {
        Self::new(
            ActionPayload::Delete {
                domain: domain.to_string(),
            },
            host,
            group,
            epoch,
        )
    }

    pub fn migrate(group: &str, source: &str, domain: &str, target: &str, epoch: u64) -> Self {
        Self::new(
            ActionPayload::Migrate {
                domain: domain.to_string(),
                target_host: target.to_string(),
            },
            source,
            group,
            epoch,
        )
    }

    pub fn power(group: &str, host: &str, domain: &str, on: bool, epoch: u64) -> Self {
        Self::new(
            ActionPayload::Power {
                domain: domain.to_string(),
                on,
            },
            host,
            group,
            epoch,
        )
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    /// Hosts the action needs exclusive use of.
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts = vec![self.host.as_str()];
        if let ActionPayload::Migrate { target_host, .. } = &self.payload
            && *target_host != self.host
        {
            hosts.push(target_host);
        }
        hosts
    }

    /// Driver invocations attempted, counting the current one.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmscale_core::Resources;

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.into(),
            image: "base.qcow2".into(),
            resources: Resources::new(1, 512, 5),
            cloud_init: None,
            network: None,
        }
    }

    #[test]
    fn id_is_deterministic() {
        let a = Action::create("web", "hv-1", spec("web-0"), 3);
        let b = Action::create("web", "hv-1", spec("web-0"), 3);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_str().len(), 16);
    }

    #[test]
    fn id_changes_with_any_input() {
        let base = Action::create("web", "hv-1", spec("web-0"), 3);
        assert_ne!(base.id, Action::create("web", "hv-1", spec("web-0"), 4).id);
        assert_ne!(base.id, Action::create("web", "hv-2", spec("web-0"), 3).id);
        assert_ne!(base.id, Action::create("api", "hv-1", spec("web-0"), 3).id);
        assert_ne!(base.id, Action::create("web", "hv-1", spec("web-1"), 3).id);
        assert_ne!(
            Action::power("web", "hv-1", "web-0", true, 3).id,
            Action::power("web", "hv-1", "web-0", false, 3).id
        );
    }

    #[test]
    fn kind_and_domain_follow_payload() {
        let m = Action::migrate("web", "hv-1", "web-0", "hv-2", 1);
        assert_eq!(m.kind(), ActionKind::MigrateVm);
        assert_eq!(m.payload.domain(), "web-0");
        assert_eq!(m.host, "hv-1");
        assert_eq!(Action::delete("web", "hv-1", "web-3", 1).payload.domain(), "web-3");
        assert_eq!(m.state, ActionState::Pending);
        assert_eq!(m.attempts(), 1);
    }
}
