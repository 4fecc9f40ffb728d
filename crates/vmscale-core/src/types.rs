//! Shared vocabulary types used by the config, the stores, and the drivers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Virtualization backend running on a host.
///
/// The set is closed: every variant must have a driver registered before
/// the control loop starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    Qemu,
    Esx,
    Xen,
}

impl HypervisorKind {
    pub const ALL: [HypervisorKind; 3] = [Self::Qemu, Self::Esx, Self::Xen];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Esx => "esx",
            Self::Xen => "xen",
        }
    }
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport used to reach a host's hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ssh,
    Tls,
}

/// CPU, memory, and storage quantities.
///
/// Memory is in MiB and storage in GiB, both for host capacity and for
/// per-VM allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    pub cpu: u32,
    pub memory: u64,
    #[serde(default)]
    pub storage: u64,
}

impl Resources {
    pub fn new(cpu: u32, memory: u64, storage: u64) -> Self {
        Self {
            cpu,
            memory,
            storage,
        }
    }

    /// True if `other` fits inside `self`.
    pub fn fits(&self, other: &Resources) -> bool {
        self.cpu >= other.cpu && self.memory >= other.memory && self.storage >= other.storage
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            storage: self.storage.saturating_sub(other.storage),
        }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            storage: self.storage + other.storage,
        }
    }
}

/// How trailing-window samples are reduced to one observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    #[default]
    #[serde(alias = "avg", alias = "average")]
    Mean,
    Max,
    Min,
    Median,
}

/// Rolling replacement flavour. Only rolling updates exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReplacementKind {
    #[default]
    RollingUpdate,
}
