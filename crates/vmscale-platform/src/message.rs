//! Outbound message shapes. Only these are part of the platform contract.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformMessage {
    ActionResult(ActionReport),
    Telemetry(TelemetryReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Terminal result of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub action_id: String,
    pub kind: String,
    pub host: String,
    pub group: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    /// True when the effect was already in place and no driver call was made.
    #[serde(default)]
    pub skipped: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub name: String,
    pub hypervisor: String,
    pub powered: bool,
    pub domains: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStanding {
    pub name: String,
    pub desired: u32,
    pub provisioned: u32,
    pub running: u32,
    /// Active domains still on an old image.
    pub outdated: u32,
}

/// Per-cycle snapshot of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub hosts: Vec<HostSummary>,
    pub groups: Vec<GroupStanding>,
    pub timestamp: u64,
}

impl PlatformMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ActionResult(_) => "action_result",
            Self::Telemetry(_) => "telemetry",
        }
    }
}
