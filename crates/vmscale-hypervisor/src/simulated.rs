//! In-memory hypervisor used for dry runs and tests.
//!
//! Keeps a per-host domain inventory and supports fault injection: queued
//! errors per operation, panics, artificial latency and unreachable hosts.
//! It also records every call and the peak number of concurrent operations
//! per host.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;
use vmscale_core::{HostConfig, Resources};

use crate::driver::{BoxFuture, Connection, Driver, NodeStats, VmSpec};
use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Open,
    Create,
    Delete,
    Migrate,
    Power,
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub host: String,
    pub op: Op,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimDomain {
    pub image: String,
    pub resources: Resources,
    pub running: bool,
}

#[derive(Default)]
struct Inner {
    /// host → domain name → domain
    domains: BTreeMap<String, BTreeMap<String, SimDomain>>,
    faults: HashMap<Op, VecDeque<DriverError>>,
    panics: HashSet<Op>,
    unreachable: HashSet<String>,
    stats: HashMap<String, NodeStats>,
    delay: Option<Duration>,
    calls: Vec<Call>,
    active: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    opened: usize,
    closed: usize,
}

impl Inner {
    fn find(&self, name: &str) -> Option<(&String, &SimDomain)> {
        self.domains
            .iter()
            .find_map(|(host, doms)| doms.get(name).map(|d| (host, d)))
    }
}

#[derive(Clone, Default)]
pub struct SimulatedDriver {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        // Injected panics never fire while the lock is held, but a test
        // thread may still poison it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: Op, err: DriverError) {
        self.fail_times(op, err, 1);
    }

    pub fn fail_times(&self, op: Op, err: DriverError, times: usize) {
        let mut s = self.state();
        let queue = s.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    /// Panic inside every subsequent call of `op`.
    pub fn panic_on(&self, op: Op) {
        self.state().panics.insert(op);
    }

    /// Delay every operation by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut s = self.state();
        if unreachable {
            s.unreachable.insert(host.to_string());
        } else {
            s.unreachable.remove(host);
        }
    }

    pub fn set_stats(&self, host: &str, stats: NodeStats) {
        self.state().stats.insert(host.to_string(), stats);
    }

    // ── Inventory ──────────────────────────────────────────────────

    pub fn insert_domain(&self, host: &str, name: &str, domain: SimDomain) {
        self.state()
            .domains
            .entry(host.to_string())
            .or_default()
            .insert(name.to_string(), domain);
    }

    /// Host and state of a domain, wherever it lives.
    pub fn domain(&self, name: &str) -> Option<(String, SimDomain)> {
        let s = self.state();
        s.find(name).map(|(h, d)| (h.clone(), d.clone()))
    }

    pub fn domains_on(&self, host: &str) -> Vec<String> {
        self.state()
            .domains
            .get(host)
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn domain_count(&self) -> usize {
        self.state().domains.values().map(BTreeMap::len).sum()
    }

    // ── Observations ───────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of calls of `op`, across hosts.
    pub fn count(&self, op: Op) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Highest number of operations that ran at once against `host`.
    pub fn peak_concurrency(&self, host: &str) -> usize {
        self.state().peak.get(host).copied().unwrap_or(0)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        let s = self.state();
        s.opened.saturating_sub(s.closed)
    }

    /// Record the call, mark it active, and return the configured delay.
    fn begin(&self, host: &str, op: Op, domain: Option<&str>) -> (ActiveGuard, Option<Duration>) {
        let mut s = self.state();
        s.calls.push(Call {
            host: host.to_string(),
            op,
            domain: domain.map(String::from),
        });
        let active = s.active.entry(host.to_string()).or_default();
        *active += 1;
        let now = *active;
        let peak = s.peak.entry(host.to_string()).or_default();
        *peak = (*peak).max(now);
        let delay = s.delay;
        drop(s);
        (
            ActiveGuard {
                driver: self.clone(),
                host: host.to_string(),
            },
            delay,
        )
    }

    /// Injected panic or queued fault for `op`, checked after the delay.
    fn injected(&self, op: Op) -> DriverResult<()> {
        let (panic, fault) = {
            let mut s = self.state();
            let panic = s.panics.contains(&op);
            let fault = s.faults.get_mut(&op).and_then(VecDeque::pop_front);
            (panic, fault)
        };
        if panic {
            panic!("injected panic in {op:?}");
        }
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reachable(&self, host: &str) -> DriverResult<()> {
        if self.state().unreachable.contains(host) {
            return Err(DriverError::Unreachable {
                host: host.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn perform<T>(
        &self,
        host: &str,
        op: Op,
        domain: Option<&str>,
        effect: impl FnOnce(&mut Inner) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let (_guard, delay) = self.begin(host, op, domain);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.reachable(host)?;
        self.injected(op)?;
        let mut s = self.state();
        effect(&mut s)
    }
}

struct ActiveGuard {
    driver: SimulatedDriver,
    host: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(n) = self.driver.state().active.get_mut(&self.host) {
            *n = n.saturating_sub(1);
        }
    }
}

impl Driver for SimulatedDriver {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open<'a>(&'a self, host: &'a HostConfig) -> BoxFuture<'a, DriverResult<Box<dyn Connection>>> {
        Box::pin(async move {
            self.perform(&host.name, Op::Open, None, |s| {
                s.opened += 1;
                Ok(())
            })
            .await?;
            Ok(Box::new(SimConnection {
                driver: self.clone(),
                host: host.name.clone(),
                closed: false,
            }) as Box<dyn Connection>)
        })
    }
}

pub struct SimConnection {
    driver: SimulatedDriver,
    host: String,
    closed: bool,
}

impl SimConnection {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.state().closed += 1;
        }
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl Connection for SimConnection {
    fn host(&self) -> &str {
        &self.host
    }

    fn create_vm<'a>(&'a mut self, spec: &'a VmSpec) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            spec.check()?;
            let host = self.host.clone();
            self.driver
                .perform(&self.host, Op::Create, Some(&spec.name), |s| {
                    if s.find(&spec.name).is_some() {
                        return Err(DriverError::AlreadyExists(spec.name.clone()));
                    }
                    s.domains.entry(host).or_default().insert(
                        spec.name.clone(),
                        SimDomain {
                            image: spec.image.clone(),
                            resources: spec.resources,
                            running: true,
                        },
                    );
                    Ok(())
                })
                .await?;
            debug!(host = %self.host, domain = %spec.name, "simulated create");
            Ok(())
        })
    }

    fn delete_vm<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            let host = self.host.clone();
            self.driver
                .perform(&self.host, Op::Delete, Some(name), |s| {
                    s.domains
                        .get_mut(&host)
                        .and_then(|d| d.remove(name))
                        .map(|_| ())
                        .ok_or_else(|| DriverError::NotFound(name.to_string()))
                })
                .await
        })
    }

    fn migrate_vm<'a>(
        &'a mut self,
        name: &'a str,
        target: &'a HostConfig,
    ) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            self.driver.reachable(&target.name)?;
            let host = self.host.clone();
            self.driver
                .perform(&self.host, Op::Migrate, Some(name), |s| {
                    let domain = s
                        .domains
                        .get_mut(&host)
                        .and_then(|d| d.remove(name))
                        .ok_or_else(|| DriverError::NotFound(name.to_string()))?;
                    s.domains
                        .entry(target.name.clone())
                        .or_default()
                        .insert(name.to_string(), domain);
                    Ok(())
                })
                .await
        })
    }

    fn set_power<'a>(&'a mut self, name: &'a str, on: bool) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            let host = self.host.clone();
            self.driver
                .perform(&self.host, Op::Power, Some(name), |s| {
                    let domain = s
                        .domains
                        .get_mut(&host)
                        .and_then(|d| d.get_mut(name))
                        .ok_or_else(|| DriverError::NotFound(name.to_string()))?;
                    domain.running = on;
                    Ok(())
                })
                .await
        })
    }

    fn node_stats(&mut self) -> BoxFuture<'_, DriverResult<NodeStats>> {
        Box::pin(async move {
            let host = self.host.clone();
            self.driver
                .perform(&self.host, Op::Stats, None, |s| {
                    Ok(s.stats.get(&host).copied().unwrap_or_default())
                })
                .await
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.release() })
    }
}
