//! Driver capability traits shared by every hypervisor backend.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use vmscale_core::{CloudInit, HostConfig, Network, Resources};

use crate::error::DriverResult;

/// Boxed future returned by driver and connection methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a backend needs to define and boot one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub image: String,
    pub resources: Resources,
    #[serde(default)]
    pub cloud_init: Option<CloudInit>,
    #[serde(default)]
    pub network: Option<Network>,
}

impl VmSpec {
    /// Reject specs no backend could satisfy.
    pub fn check(&self) -> DriverResult<()> {
        use crate::error::DriverError;
        if self.name.is_empty() {
            return Err(DriverError::InvalidSpec("empty domain name".into()));
        }
        if self.image.is_empty() {
            return Err(DriverError::InvalidSpec(format!("{}: empty image", self.name)));
        }
        if self.resources.cpu == 0 || self.resources.memory == 0 {
            return Err(DriverError::InvalidSpec(format!(
                "{}: cpu and memory must be non-zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Host utilization sample, both values in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NodeStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// A backend able to connect to hosts of one hypervisor kind.
pub trait Driver: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Open a connection to `host`.
    fn open<'a>(&'a self, host: &'a HostConfig) -> BoxFuture<'a, DriverResult<Box<dyn Connection>>>;
}

/// An open session against one host.
///
/// Callers must call [`Connection::close`] on every path; implementations
/// also release their resources on drop.
pub trait Connection: Send {
    fn host(&self) -> &str;

    fn create_vm<'a>(&'a mut self, spec: &'a VmSpec) -> BoxFuture<'a, DriverResult<()>>;

    fn delete_vm<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DriverResult<()>>;

    /// Live-migrate `name` from this host to `target`.
    fn migrate_vm<'a>(
        &'a mut self,
        name: &'a str,
        target: &'a HostConfig,
    ) -> BoxFuture<'a, DriverResult<()>>;

    fn set_power<'a>(&'a mut self, name: &'a str, on: bool) -> BoxFuture<'a, DriverResult<()>>;

    fn node_stats(&mut self) -> BoxFuture<'_, DriverResult<NodeStats>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;

    fn spec() -> VmSpec {
        VmSpec {
            name: "web-0".into(),
            image: "/images/ubuntu.qcow2".into(),
            resources: Resources::new(2, 2048, 20),
            cloud_init: None,
            network: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(spec().check().is_ok());
    }

    #[test]
    fn zero_resources_rejected() {
        let mut s = spec();
        s.resources.cpu = 0;
        assert!(matches!(s.check(), Err(DriverError::InvalidSpec(_))));
    }

    #[test]
    fn empty_image_rejected() {
        let mut s = spec();
        s.image.clear();
        assert!(matches!(s.check(), Err(DriverError::InvalidSpec(_))));
    }
}
