//! End-to-end tests: reconciler, queue, executor and a simulated hypervisor
//! wired together the way the daemon wires them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use vmscale_actions::{Action, ActionQueue, Executor, ExecutorSettings};
use vmscale_autoscale::{Reconciler, ReconcilerSettings};
use vmscale_core::ControllerConfig;
use vmscale_hypervisor::{DriverRegistry, Op, SimDomain, SimulatedDriver, VmSpec};
use vmscale_metrics::{MetricsStore, Sample};
use vmscale_platform::{PlatformBridge, PlatformMessage};
use vmscale_state::{DomainRecord, DomainState, StateStore};

const GROUP: &str = "default";

struct Pipeline {
    config: ControllerConfig,
    state: StateStore,
    metrics: MetricsStore,
    sim: SimulatedDriver,
    queue: Arc<ActionQueue>,
    executor: Executor,
    reconciler: Reconciler,
    platform: mpsc::Receiver<PlatformMessage>,
    shutdown: watch::Sender<bool>,
}

/// Two member hosts, cpu as the only target metric, a one minute cooldown.
fn two_host_config(min: u32, max: u32, desired: u32) -> ControllerConfig {
    let mut config = ControllerConfig::scaffold();
    let autoscale = &mut config.controller.autoscale;
    let mut second = autoscale.hosts[0].clone();
    second.name = "hv-2".into();
    autoscale.hosts.push(second);

    let group = autoscale.groups.get_mut(GROUP).unwrap();
    group.hosts = vec!["hv-1".into(), "hv-2".into()];
    group.scaling.min = min;
    group.scaling.max = max;
    group.scaling.desired = desired;
    group.scaling.cooldown = 60;
    group.scaling.target_utilization.remove("memory");
    config
}

fn pipeline(config: ControllerConfig, capacity: usize) -> Pipeline {
    let state = StateStore::open_in_memory().unwrap();
    let metrics = MetricsStore::open_in_memory().unwrap();
    state.sync_inventory(&config, 0).unwrap();

    let sim = SimulatedDriver::new();
    let registry = DriverRegistry::uniform(Arc::new(sim.clone()));
    let queue = Arc::new(ActionQueue::new(capacity));
    let (bridge, platform) = PlatformBridge::channel(256);

    let executor = Executor::new(
        queue.clone(),
        state.clone(),
        registry,
        bridge.clone(),
        ExecutorSettings {
            workers: 4,
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            contention_delay: Duration::from_millis(5),
            op_timeout: Duration::from_secs(1),
        },
    );
    let reconciler = Reconciler::new(&config, state.clone(), metrics.clone(), queue.clone(), bridge)
        .with_settings(ReconcilerSettings {
            interval: Duration::from_secs(1),
            trailing: 10,
            poll_interval: Duration::from_millis(20),
            poll_attempts: 50,
        });
    let (shutdown, _) = watch::channel(false);

    Pipeline {
        config,
        state,
        metrics,
        sim,
        queue,
        executor,
        reconciler,
        platform,
        shutdown,
    }
}

impl Pipeline {
    fn start_executor(&self) -> tokio::task::JoinHandle<()> {
        let executor = self.executor.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { executor.run(shutdown).await })
    }

    async fn stop(&self, handle: tokio::task::JoinHandle<()>) {
        let _ = self.shutdown.send(true);
        handle.await.unwrap();
    }

    /// Wait until every admitted action has finished.
    async fn settle(&self) {
        for _ in 0..300 {
            if self.queue.admitted() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain: {} admitted", self.queue.admitted());
    }

    fn cpu(&self, value: f64) {
        for host in ["hv-1", "hv-2"] {
            for ts in 0..5 {
                self.metrics.record(host, "cpu", Sample::new(ts, value)).unwrap();
            }
        }
    }

    fn image(&self) -> String {
        self.config.controller.autoscale.groups[GROUP].image.clone()
    }

    /// A running domain known to both the state store and the hypervisor.
    fn seed(&self, name: &str, host: &str, image: &str) {
        let resources = self.config.controller.autoscale.groups[GROUP].vm;
        self.state
            .upsert_domain(&DomainRecord {
                name: name.into(),
                host: host.into(),
                group: GROUP.into(),
                image: image.into(),
                resources,
                state: DomainState::Running,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        self.sim.insert_domain(
            host,
            name,
            SimDomain {
                image: image.into(),
                resources,
                running: true,
            },
        );
    }

    fn domains(&self) -> Vec<DomainRecord> {
        self.state.list_domains_by_group(GROUP).unwrap()
    }
}

#[tokio::test]
async fn sustained_cpu_scales_up_within_cooldown_bounds() {
    let mut p = pipeline(two_host_config(1, 4, 2), 16);
    let executor = p.start_executor();

    // Bootstrap to the configured size with no metrics yet.
    let reports = p.reconciler.reconcile_at(0).await;
    assert_eq!(reports[0].accepted, 2);
    p.settle().await;
    assert_eq!(p.sim.domain_count(), 2);

    p.cpu(85.0);
    p.reconciler.reconcile_at(1000).await;
    p.settle().await;
    assert_eq!(p.domains().len(), 3);
    assert_eq!(p.reconciler.group_state(GROUP).unwrap().desired, 3);

    // Still inside the cooldown.
    let reports = p.reconciler.reconcile_at(1030).await;
    assert_eq!(reports[0].accepted, 0);
    assert_eq!(reports[0].desired, 3);
    p.settle().await;
    assert_eq!(p.domains().len(), 3);

    p.reconciler.reconcile_at(1061).await;
    p.settle().await;
    assert_eq!(p.domains().len(), 4);
    assert_eq!(p.sim.domain_count(), 4);

    // At max, the signal changes nothing.
    let reports = p.reconciler.reconcile_at(2000).await;
    assert_eq!(reports[0].desired, 4);
    assert_eq!(reports[0].accepted, 0);

    p.stop(executor).await;
}

#[tokio::test]
async fn image_change_rolls_one_domain_at_a_time() {
    let mut config = two_host_config(1, 5, 4);
    {
        let group = config.controller.autoscale.groups.get_mut(GROUP).unwrap();
        group.replacement.max_surge = 1;
        group.replacement.max_unavailable = 1;
    }
    let mut p = pipeline(config, 16);
    for (i, host) in ["hv-1", "hv-2", "hv-1", "hv-2"].iter().enumerate() {
        p.seed(&format!("default-{i}"), host, "/images/old.qcow2");
    }
    let executor = p.start_executor();

    p.reconciler.reconcile_at(0).await;
    p.settle().await;

    let image = p.image();
    let domains = p.domains();
    assert_eq!(domains.len(), 4);
    assert!(domains.iter().all(|d| d.image == image && d.is_running()));
    assert_eq!(p.sim.domain_count(), 4);

    let sequence: Vec<Op> = p
        .sim
        .calls()
        .into_iter()
        .map(|c| c.op)
        .filter(|op| matches!(op, Op::Create | Op::Delete))
        .collect();
    let expected: Vec<Op> = [Op::Create, Op::Delete].repeat(4);
    assert_eq!(sequence, expected);

    // Converged: a further cycle emits nothing.
    let reports = p.reconciler.reconcile_at(10).await;
    assert_eq!(reports[0].accepted, 0);

    p.stop(executor).await;
}

#[tokio::test]
async fn full_queue_defers_the_rest_to_the_next_cycle() {
    let mut p = pipeline(two_host_config(1, 4, 4), 2);

    // Executor not running yet: only two creates fit.
    let reports = p.reconciler.reconcile_at(0).await;
    assert_eq!(reports[0].accepted, 2);
    assert!(reports[0].queue_full);
    assert_eq!(p.queue.admitted(), 2);

    let executor = p.start_executor();
    p.settle().await;
    assert_eq!(p.domains().len(), 2);

    let reports = p.reconciler.reconcile_at(1).await;
    assert_eq!(reports[0].accepted, 2);
    assert!(!reports[0].queue_full);
    p.settle().await;
    assert_eq!(p.domains().len(), 4);
    assert_eq!(p.sim.count(Op::Create), 4);
    assert_eq!(p.reconciler.group_state(GROUP).unwrap().desired, 4);

    p.stop(executor).await;
}

#[tokio::test]
async fn hosts_run_one_action_at_a_time_and_replays_are_skipped() {
    let mut p = pipeline(two_host_config(1, 4, 4), 16);
    p.sim.set_delay(Duration::from_millis(30));
    let executor = p.start_executor();

    p.reconciler.reconcile_at(0).await;
    p.settle().await;
    assert_eq!(p.sim.count(Op::Create), 4);
    assert!(p.sim.peak_concurrency("hv-1") <= 1);
    assert!(p.sim.peak_concurrency("hv-2") <= 1);
    assert_eq!(p.sim.open_connections(), 0);

    // A stale create for a domain that already exists converges without a
    // driver call.
    let existing = p.domains().remove(0);
    let spec = VmSpec {
        name: existing.name.clone(),
        image: existing.image.clone(),
        resources: existing.resources,
        cloud_init: None,
        network: None,
    };
    p.queue
        .enqueue(Action::create(GROUP, &existing.host, spec, 99))
        .unwrap();
    p.settle().await;
    assert_eq!(p.sim.count(Op::Create), 4);

    let mut skipped = 0;
    while let Ok(message) = p.platform.try_recv() {
        if let PlatformMessage::ActionResult(report) = message
            && report.skipped
        {
            skipped += 1;
        }
    }
    assert_eq!(skipped, 1);

    p.stop(executor).await;
}

#[tokio::test]
async fn config_file_bootstraps_a_group() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vmscale.toml");
    assert!(ControllerConfig::write_default(&path).unwrap());
    let config = ControllerConfig::load(&path).unwrap();

    let mut p = pipeline(config, 16);
    let executor = p.start_executor();
    p.reconciler.reconcile_at(0).await;
    p.settle().await;

    let domains = p.domains();
    assert_eq!(domains.len(), 2);
    assert!(domains.iter().all(|d| d.host == "hv-1"));
    let mut names: Vec<String> = domains.into_iter().map(|d| d.name).collect();
    names.sort();
    assert_eq!(names, ["default-0", "default-1"]);

    let hosts = p.state.list_hosts_by_group(GROUP).unwrap();
    assert_eq!(hosts.len(), 1);
    assert!(hosts[0].powered);

    p.stop(executor).await;
}
