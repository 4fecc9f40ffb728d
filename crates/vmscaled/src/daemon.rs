//! Daemon wiring — opens the stores, builds every component, and runs the
//! long-lived tasks until Ctrl-C.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use vmscale_actions::{ActionQueue, Executor, ExecutorSettings};
use vmscale_autoscale::Reconciler;
use vmscale_core::{ControllerConfig, epoch_secs};
use vmscale_hypervisor::{DriverRegistry, SimDomain, SimulatedDriver, VirshDriver};
use vmscale_metrics::{MetricsCollector, MetricsStore};
use vmscale_platform::{LogSink, PlatformBridge, PlatformSink, forward};
use vmscale_state::StateStore;

pub async fn run(config: ControllerConfig, dry_run: bool) -> anyhow::Result<()> {
    let controller = &config.controller;
    info!(
        hosts = controller.autoscale.hosts.len(),
        groups = controller.autoscale.groups.len(),
        dry_run,
        "vmscale daemon starting"
    );

    // ── Stores ─────────────────────────────────────────────────

    let state_path = &controller.databases.state.path;
    ensure_parent(state_path)?;
    let state = StateStore::open(state_path)?;
    info!(path = ?state_path, "state store opened");

    let metrics_path = &controller.databases.timeseries.path;
    ensure_parent(metrics_path)?;
    let metrics = MetricsStore::open(metrics_path)?;
    info!(path = ?metrics_path, "metrics store opened");

    state.sync_inventory(&config, epoch_secs())?;

    // ── Drivers ────────────────────────────────────────────────

    let registry = if dry_run {
        simulated_registry(&state)?
    } else {
        DriverRegistry::uniform(Arc::new(VirshDriver::new()))
    };
    registry.ensure_covers(&controller.autoscale.hosts)?;

    // ── Pipeline ───────────────────────────────────────────────

    let (bridge, outbound) = PlatformBridge::channel(controller.platform.buffer_size);
    let sink: Arc<dyn PlatformSink> = Arc::new(LogSink::new(controller.platform.domain.clone()));
    if controller.platform.token.is_none() {
        warn!("no platform token configured, events are only logged");
    }

    let queue = Arc::new(ActionQueue::new(controller.platform.actions_queue_max_size));
    let executor = Executor::new(
        queue.clone(),
        state.clone(),
        registry.clone(),
        bridge.clone(),
        ExecutorSettings::from_config(&config),
    );
    let collector = MetricsCollector::new(metrics.clone(), registry, &config);
    let mut reconciler = Reconciler::new(&config, state, metrics, queue, bridge);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // The forwarder stops last so results of in-flight actions still go out.
    let (drain_tx, drain_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let forwarder = tokio::spawn(forward(outbound, sink, drain_rx));

    let executor_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { executor.run(shutdown).await })
    };
    let collector_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { collector.run(shutdown).await })
    };
    let reconciler_handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reconciler_handle.await;
    let _ = collector_handle.await;
    let _ = executor_handle.await;
    let _ = drain_tx.send(true);
    let _ = forwarder.await;

    info!("vmscale daemon stopped");
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

/// Simulated hypervisors seeded with the domains the state store knows.
fn simulated_registry(state: &StateStore) -> anyhow::Result<DriverRegistry> {
    let sim = SimulatedDriver::new();
    for host in state.list_hosts()? {
        for domain in state.list_domains_by_host(&host.name)? {
            sim.insert_domain(
                &host.name,
                &domain.name,
                SimDomain {
                    running: domain.is_running(),
                    image: domain.image,
                    resources: domain.resources,
                },
            );
        }
    }
    warn!(domains = sim.domain_count(), "dry run: hypervisor calls are simulated");
    Ok(DriverRegistry::uniform(Arc::new(sim)))
}
