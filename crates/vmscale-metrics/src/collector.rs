//! Metrics collector — periodically samples host utilization.
//!
//! Each round opens a short-lived driver connection per host, reads
//! `node_stats`, and records one `cpu` and one `memory` sample under the
//! host's name. Concurrent connections are capped by a semaphore and every
//! driver call is bounded by the host connection timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vmscale_core::{ControllerConfig, HostConfig, epoch_secs};
use vmscale_hypervisor::{DriverError, DriverRegistry, NodeStats};

use crate::error::MetricsResult;
use crate::store::{MetricsStore, Sample};

pub const METRIC_CPU: &str = "cpu";
pub const METRIC_MEMORY: &str = "memory";

/// Outcome of one collection round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub sampled: usize,
    pub failed: usize,
    pub pruned: usize,
}

pub struct MetricsCollector {
    store: MetricsStore,
    registry: DriverRegistry,
    hosts: Vec<HostConfig>,
    interval: Duration,
    connect_timeout: Duration,
    permits: Arc<Semaphore>,
    /// Seconds of history to keep.
    retention: u64,
}

impl MetricsCollector {
    pub fn new(store: MetricsStore, registry: DriverRegistry, config: &ControllerConfig) -> Self {
        let db = &config.controller.databases;
        Self {
            store,
            registry,
            hosts: config.controller.autoscale.hosts.clone(),
            interval: config.collection_interval(),
            connect_timeout: config.host_connection_timeout(),
            permits: Arc::new(Semaphore::new(db.max_host_connection_threads.max(1))),
            retention: db.timeseries.retention,
        }
    }

    /// Sample every host once, stamping samples with `now`.
    pub async fn collect_at(&self, now: u64) -> MetricsResult<CollectReport> {
        let mut tasks = JoinSet::new();
        for host in self.hosts.iter().cloned() {
            let registry = self.registry.clone();
            let permits = self.permits.clone();
            let limit = self.connect_timeout;
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                let result = sample_host(&registry, &host, limit).await;
                (host.name, result)
            });
        }

        let mut report = CollectReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (host, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "host sampling task failed");
                    report.failed += 1;
                    continue;
                }
            };
            match result {
                Ok(stats) => {
                    self.store
                        .record(&host, METRIC_CPU, Sample::new(now, stats.cpu_percent))?;
                    self.store
                        .record(&host, METRIC_MEMORY, Sample::new(now, stats.memory_percent))?;
                    debug!(
                        %host,
                        cpu = stats.cpu_percent,
                        memory = stats.memory_percent,
                        "host sampled"
                    );
                    report.sampled += 1;
                }
                Err(e) => {
                    warn!(%host, error = %e, "host sampling skipped");
                    report.failed += 1;
                }
            }
        }

        report.pruned = self.store.prune_before(now.saturating_sub(self.retention))?;
        Ok(report)
    }

    pub async fn collect(&self) -> MetricsResult<CollectReport> {
        self.collect_at(epoch_secs()).await
    }

    /// Run the collection loop until shutdown signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            hosts = self.hosts.len(),
            "metrics collector started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.collect().await {
                        Ok(report) => debug!(?report, "collection round finished"),
                        Err(e) => tracing::error!(error = %e, "metrics collection failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}

async fn sample_host(
    registry: &DriverRegistry,
    host: &HostConfig,
    limit: Duration,
) -> Result<NodeStats, DriverError> {
    let timed_out = |operation: &str| DriverError::Timeout {
        operation: format!("{operation} on {}", host.name),
    };

    let driver = registry.resolve(host.hypervisor)?;
    let mut conn = timeout(limit, driver.open(host))
        .await
        .map_err(|_| timed_out("open"))??;
    let stats = timeout(limit, conn.node_stats())
        .await
        .map_err(|_| timed_out("node_stats"));
    conn.close().await;
    stats?
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmscale_hypervisor::{Op, SimulatedDriver};

    fn config(hosts: &[&str], threads: usize) -> ControllerConfig {
        let mut config = ControllerConfig::scaffold();
        let template = config.controller.autoscale.hosts[0].clone();
        config.controller.autoscale.hosts = hosts
            .iter()
            .map(|name| HostConfig {
                name: name.to_string(),
                ..template.clone()
            })
            .collect();
        config.controller.databases.max_host_connection_threads = threads;
        config.controller.databases.host_connection_timeout = 1;
        config.controller.databases.timeseries.retention = 100;
        config
    }

    fn stats(cpu: f64, memory: f64) -> NodeStats {
        NodeStats {
            cpu_percent: cpu,
            memory_percent: memory,
        }
    }

    #[tokio::test]
    async fn records_cpu_and_memory_per_host() {
        let sim = SimulatedDriver::new();
        sim.set_stats("hv-1", stats(85.0, 40.0));
        sim.set_stats("hv-2", stats(10.0, 20.0));
        let store = MetricsStore::open_in_memory().unwrap();
        let collector = MetricsCollector::new(
            store.clone(),
            DriverRegistry::uniform(Arc::new(sim.clone())),
            &config(&["hv-1", "hv-2"], 2),
        );

        let report = collector.collect_at(1000).await.unwrap();
        assert_eq!(report.sampled, 2);
        assert_eq!(report.failed, 0);

        let cpu = store.trailing_window("hv-1", METRIC_CPU, 5).unwrap();
        assert_eq!(cpu, vec![Sample::new(1000, 85.0)]);
        let mem = store.trailing_window("hv-2", METRIC_MEMORY, 5).unwrap();
        assert_eq!(mem, vec![Sample::new(1000, 20.0)]);
        assert_eq!(sim.open_connections(), 0);
    }

    #[tokio::test]
    async fn unreachable_host_is_skipped() {
        let sim = SimulatedDriver::new();
        sim.set_unreachable("hv-2", true);
        let store = MetricsStore::open_in_memory().unwrap();
        let collector = MetricsCollector::new(
            store.clone(),
            DriverRegistry::uniform(Arc::new(sim)),
            &config(&["hv-1", "hv-2"], 2),
        );

        let report = collector.collect_at(1000).await.unwrap();
        assert_eq!(report.sampled, 1);
        assert_eq!(report.failed, 1);
        assert!(store.trailing_window("hv-2", METRIC_CPU, 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn hung_host_times_out() {
        let sim = SimulatedDriver::new();
        sim.set_delay(Duration::from_secs(5));
        let store = MetricsStore::open_in_memory().unwrap();
        let collector = MetricsCollector::new(
            store,
            DriverRegistry::uniform(Arc::new(sim.clone())),
            &config(&["hv-1"], 1),
        );

        let report = collector.collect_at(1000).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(sim.count(Op::Stats), 0);
    }

    #[tokio::test]
    async fn old_samples_pruned_by_retention() {
        let sim = SimulatedDriver::new();
        let store = MetricsStore::open_in_memory().unwrap();
        store.record("hv-1", METRIC_CPU, Sample::new(500, 1.0)).unwrap();
        let collector = MetricsCollector::new(
            store.clone(),
            DriverRegistry::uniform(Arc::new(sim)),
            &config(&["hv-1"], 1),
        );

        let report = collector.collect_at(1000).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(store.trailing_window("hv-1", METRIC_CPU, 5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connection_cap_is_respected() {
        let sim = SimulatedDriver::new();
        sim.set_delay(Duration::from_millis(20));
        let hosts = ["hv-1", "hv-2", "hv-3", "hv-4"];
        let collector = MetricsCollector::new(
            MetricsStore::open_in_memory().unwrap(),
            DriverRegistry::uniform(Arc::new(sim.clone())),
            &config(&hosts, 1),
        );

        let start = tokio::time::Instant::now();
        let report = collector.collect_at(1000).await.unwrap();
        assert_eq!(report.sampled, 4);
        // Serialized: 4 hosts × (open + stats) × 20ms.
        assert!(start.elapsed() >= Duration::from_millis(160));
    }
}
