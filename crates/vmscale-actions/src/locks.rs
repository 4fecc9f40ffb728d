//! Per-host exclusivity: at most one action touches a host at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct HostLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Held while an action runs against a host; dropping it releases the host.
pub type HostGuard = OwnedMutexGuard<()>;

impl HostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, host: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    /// Take the host lock if nobody holds it. Never waits.
    pub fn try_acquire(&self, host: &str) -> Option<HostGuard> {
        self.lock_for(host).try_lock_owned().ok()
    }

    /// Take every listed host lock or none of them, in name order.
    pub fn try_acquire_all(&self, hosts: &[&str]) -> Option<Vec<HostGuard>> {
        let mut hosts = hosts.to_vec();
        hosts.sort_unstable();
        hosts.dedup();
        hosts.into_iter().map(|host| self.try_acquire(host)).collect()
    }

    pub fn is_held(&self, host: &str) -> bool {
        self.lock_for(host).try_lock().is_err()
    }
}
