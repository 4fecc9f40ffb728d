//! vmscale-hypervisor — one capability interface over qemu, esx and xen.
//!
//! # Architecture
//!
//! ```text
//! DriverRegistry (HypervisorKind → Arc<dyn Driver>)
//!   └── Driver::open(host) → Box<dyn Connection>
//!         ├── create_vm / delete_vm / migrate_vm / set_power
//!         ├── node_stats        ← metrics collector
//!         └── close
//!
//! VirshDriver      — virsh + virt-install over ssh/tls/esx URIs
//! SimulatedDriver  — in-memory inventory with fault injection
//! ```

pub mod driver;
pub mod error;
pub mod registry;
pub mod simulated;
pub mod virsh;

pub use driver::{BoxFuture, Connection, Driver, NodeStats, VmSpec};
pub use error::{DriverError, DriverResult};
pub use registry::DriverRegistry;
pub use simulated::{Op, SimDomain, SimulatedDriver};
pub use virsh::VirshDriver;
