//! Explicit hypervisor-kind → driver mapping, resolved once per connection.

use std::collections::HashMap;
use std::sync::Arc;

use vmscale_core::{ConfigError, HostConfig, HypervisorKind};

use crate::driver::Driver;
use crate::error::{DriverError, DriverResult};

#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<HypervisorKind, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every kind to the same driver.
    pub fn uniform(driver: Arc<dyn Driver>) -> Self {
        let mut registry = Self::new();
        for kind in HypervisorKind::ALL {
            registry.register(kind, driver.clone());
        }
        registry
    }

    pub fn register(&mut self, kind: HypervisorKind, driver: Arc<dyn Driver>) {
        self.drivers.insert(kind, driver);
    }

    pub fn resolve(&self, kind: HypervisorKind) -> DriverResult<Arc<dyn Driver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| DriverError::NoDriver(kind.to_string()))
    }

    /// Fail if any configured host declares a kind without a driver.
    pub fn ensure_covers(&self, hosts: &[HostConfig]) -> Result<(), ConfigError> {
        for host in hosts {
            if !self.drivers.contains_key(&host.hypervisor) {
                return Err(ConfigError::Invalid {
                    field: format!("autoscale.hosts.{}.hypervisor", host.name),
                    reason: format!("no driver registered for {}", host.hypervisor),
                });
            }
        }
        Ok(())
    }
}
