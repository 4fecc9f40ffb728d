//! Reconciler — turns utilization and declared policy into actions.
//!
//! Per group, per cycle:
//!
//! ```text
//! state store ──► domains, member hosts
//! metrics store ─► observe ─► DecisionPolicy ─► signal
//!                                  │ cooldown elapsed?
//!                                  ▼
//!                 target = clamp(desired ± increment, min, max)
//!
//! repairs: power on stopped domains, migrate off hosts that left the group
//! image drift? ─ yes ─► rollout step ─► poll state store ─► next step …
//!              └ no ──► converge to target (create / delete)
//!
//! every action accepted? ─► commit target and restart the cooldown
//! queue full? ────────────► stop the group, resume next cycle
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use vmscale_actions::{Action, ActionQueue, Enqueued};
use vmscale_core::{AutoscalingGroupConfig, ControllerConfig, ScaleStrategy, epoch_secs};
use vmscale_hypervisor::VmSpec;
use vmscale_metrics::MetricsStore;
use vmscale_platform::{
    GroupStanding, HostSummary, PlatformBridge, PlatformMessage, TelemetryReport,
};
use vmscale_rollout::{RolloutStatus, RolloutStep, plan_step};
use vmscale_state::{DomainRecord, DomainState, HostRecord, StateResult, StateStore};

use crate::placement::{Names, Placement, victims};
use crate::policy::{DecisionPolicy, ScaleSignal, ThresholdPolicy, observe};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    /// Samples per host and metric fed to the decision.
    pub trailing: usize,
    /// Pause between state store checks while a rollout step lands.
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl ReconcilerSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        let reconciliation = &config.controller.reconciliation;
        Self {
            interval: config.reconciliation_interval(),
            trailing: config.controller.databases.timeseries.trailing,
            poll_interval: Duration::from_secs(reconciliation.replacement_poll_interval),
            poll_attempts: reconciliation.replacement_poll_attempts,
        }
    }
}

/// Scaling memory of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupState {
    pub desired: u32,
    /// Unix time of the last committed scaling decision.
    pub last_action: Option<u64>,
}

impl GroupState {
    /// First sight of a group: adopt the provisioned size, or the configured
    /// one when nothing is provisioned yet.
    fn adopt(scaling: &ScaleStrategy, provisioned: u32) -> Self {
        let desired = if provisioned == 0 {
            scaling.desired
        } else {
            provisioned
        };
        Self {
            desired: scaling.clamp(desired),
            last_action: None,
        }
    }

    fn cooled_down(&self, now: u64, cooldown: u64) -> bool {
        self.last_action
            .is_none_or(|at| now.saturating_sub(at) >= cooldown)
    }
}

/// What one cycle did for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub group: String,
    pub signal: ScaleSignal,
    /// Desired size once the cycle is over.
    pub desired: u32,
    pub accepted: usize,
    pub duplicates: usize,
    /// The queue rejected an action and the group stopped early.
    pub queue_full: bool,
    /// A store read failed and the group was left alone.
    pub skipped: bool,
}

/// State store condition that marks a rollout step as done.
#[derive(Debug)]
enum Landing {
    Running(Vec<String>),
    Gone(String),
}

/// One group's records plus the bookkeeping needed to plan against them.
struct GroupPlan<'a> {
    name: &'a str,
    group: &'a AutoscalingGroupConfig,
    target: u32,
    domains: Vec<DomainRecord>,
    members: Vec<HostRecord>,
    names: Names,
    placement: Placement,
}

impl<'a> GroupPlan<'a> {
    fn load(
        state: &StateStore,
        name: &'a str,
        group: &'a AutoscalingGroupConfig,
        target: u32,
    ) -> StateResult<Self> {
        let domains = state.list_domains_by_group(name)?;
        let members = state.list_hosts_by_group(name)?;
        let mut candidates = Vec::with_capacity(members.len());
        for host in &members {
            candidates.push((host.clone(), state.list_domains_by_host(&host.name)?));
        }
        let names = Names::new(
            &group.domain_name,
            name,
            domains.iter().map(|d| d.name.as_str()),
        );
        Ok(Self {
            name,
            group,
            target,
            placement: Placement::new(name, candidates),
            names,
            domains,
            members,
        })
    }

    /// Actions are keyed to the size they were derived for.
    fn epoch(&self) -> u64 {
        u64::from(self.target)
    }

    fn create(&mut self) -> Option<Action> {
        let host = self.placement.place(&self.group.vm)?;
        let spec = VmSpec {
            name: self.names.next_name(),
            image: self.group.image.clone(),
            resources: self.group.vm,
            cloud_init: self.group.cloud_init.clone(),
            network: self.group.networking.clone(),
        };
        Some(Action::create(self.name, &host, spec, self.epoch()))
    }

    fn creates(&mut self, count: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        for _ in 0..count {
            let Some(action) = self.create() else {
                warn!(
                    group = self.name,
                    wanted = count,
                    placed = actions.len(),
                    "no member host has room for another domain"
                );
                break;
            };
            actions.push(action);
        }
        actions
    }

    /// Power on stopped current-image domains and move running domains off
    /// hosts that are no longer members.
    fn repairs(&mut self) -> Vec<Action> {
        let epoch = self.epoch();
        let members: HashSet<&str> = self.members.iter().map(|h| h.name.as_str()).collect();
        let mut actions = Vec::new();

        for d in self.domains.iter().filter(|d| d.is_active()) {
            let power_on = d.state == DomainState::Stopped && d.image == self.group.image;
            if power_on {
                actions.push(Action::power(self.name, &d.host, &d.name, true, epoch));
            }
            if members.contains(d.host.as_str()) || !(power_on || d.is_running()) {
                continue;
            }
            match self.placement.place(&self.group.vm) {
                Some(target) => {
                    actions.push(Action::migrate(self.name, &d.host, &d.name, &target, epoch));
                }
                None => warn!(
                    group = self.name,
                    domain = %d.name,
                    host = %d.host,
                    "no member host can take domain off removed host"
                ),
            }
        }
        actions
    }

    /// Create or delete toward the target size.
    fn converge(&mut self) -> Vec<Action> {
        let active = self.domains.iter().filter(|d| d.is_active()).count() as u32;
        if active < self.target {
            return self.creates(self.target - active);
        }
        let excess = (active - self.target) as usize;
        victims(&self.domains, &self.group.image, excess)
            .into_iter()
            .map(|d| Action::delete(self.name, &d.host, &d.name, self.epoch()))
            .collect()
    }

    fn retire(&self, domain: &str) -> Option<Action> {
        let record = self.domains.iter().find(|d| d.name == domain)?;
        Some(Action::delete(self.name, &record.host, domain, self.epoch()))
    }
}

/// New desired size for `signal`, or the current one if the signal is held
/// back by the cooldown or the bounds.
fn scale_target(
    group: &str,
    scaling: &ScaleStrategy,
    current: GroupState,
    signal: ScaleSignal,
    now: u64,
) -> u32 {
    let wanted = match signal {
        ScaleSignal::Hold => return current.desired,
        ScaleSignal::Up => current.desired.saturating_add(scaling.increment),
        ScaleSignal::Down => current.desired.saturating_sub(scaling.increment),
    };
    if !current.cooled_down(now, scaling.cooldown) {
        debug!(group, %signal, "cooldown active, signal ignored");
        return current.desired;
    }
    let next = scaling.clamp(wanted);
    if next == current.desired {
        debug!(group, %signal, desired = next, "already at size bound");
        return current.desired;
    }
    info!(group, %signal, from = current.desired, to = next, "scaling decision");
    next
}

/// Drives every configured group toward its declared shape.
pub struct Reconciler {
    groups: BTreeMap<String, AutoscalingGroupConfig>,
    state: StateStore,
    metrics: MetricsStore,
    queue: Arc<ActionQueue>,
    bridge: PlatformBridge,
    policy: Box<dyn DecisionPolicy>,
    settings: ReconcilerSettings,
    /// Per-group desired size and cooldown, filled on a group's first cycle.
    standing: HashMap<String, GroupState>,
}

impl Reconciler {
    pub fn new(
        config: &ControllerConfig,
        state: StateStore,
        metrics: MetricsStore,
        queue: Arc<ActionQueue>,
        bridge: PlatformBridge,
    ) -> Self {
        Self {
            groups: config.controller.autoscale.groups.clone(),
            state,
            metrics,
            queue,
            bridge,
            policy: Box::new(ThresholdPolicy),
            settings: ReconcilerSettings::from_config(config),
            standing: HashMap::new(),
        }
    }

    /// Replace the default threshold policy.
    pub fn with_policy(mut self, policy: impl DecisionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn group_state(&self, group: &str) -> Option<GroupState> {
        self.standing.get(group).copied()
    }

    /// Reconcile every interval until shutdown signal.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            groups = self.groups.len(),
            interval_secs = self.settings.interval.as_secs(),
            "reconciler started"
        );
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            // Shutdown also cuts a cycle short, e.g. one polling a rollout.
            // Actions already enqueued stay with the executor.
            tokio::select! {
                _ = self.reconcile() => {}
                _ = shutdown.changed() => {
                    info!("shutdown during reconciliation, cycle abandoned");
                    break;
                }
            }
        }
        info!("reconciler shutting down");
    }

    pub async fn reconcile(&mut self) -> Vec<GroupReport> {
        self.reconcile_at(epoch_secs()).await
    }

    /// Run one cycle over every group, with `now` as the cooldown clock.
    pub async fn reconcile_at(&mut self, now: u64) -> Vec<GroupReport> {
        let groups = self.groups.clone();
        let mut reports = Vec::with_capacity(groups.len());

        for (name, group) in &groups {
            let report = match self.reconcile_group(name, group, now).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(group = %name, error = %format!("{e:#}"), "group skipped this cycle");
                    GroupReport {
                        group: name.clone(),
                        desired: self.desired_or_configured(name, group),
                        skipped: true,
                        ..Default::default()
                    }
                }
            };
            debug!(
                group = %name,
                signal = %report.signal,
                desired = report.desired,
                accepted = report.accepted,
                duplicates = report.duplicates,
                queue_full = report.queue_full,
                "group reconciled"
            );
            reports.push(report);
        }

        match self.telemetry(now) {
            Ok(report) => {
                self.bridge.publish(PlatformMessage::Telemetry(report));
            }
            Err(e) => warn!(error = %e, "telemetry snapshot failed"),
        }
        reports
    }

    fn current(
        &mut self,
        name: &str,
        group: &AutoscalingGroupConfig,
        domains: &[DomainRecord],
    ) -> GroupState {
        *self.standing.entry(name.to_string()).or_insert_with(|| {
            let provisioned = domains.iter().filter(|d| d.is_active()).count() as u32;
            let adopted = GroupState::adopt(&group.scaling, provisioned);
            info!(group = name, provisioned, desired = adopted.desired, "group adopted");
            adopted
        })
    }

    fn desired_or_configured(&self, name: &str, group: &AutoscalingGroupConfig) -> u32 {
        self.standing
            .get(name)
            .map_or(group.scaling.clamp(group.scaling.desired), |s| s.desired)
    }

    async fn reconcile_group(
        &mut self,
        name: &str,
        group: &AutoscalingGroupConfig,
        now: u64,
    ) -> Result<GroupReport> {
        let mut plan =
            GroupPlan::load(&self.state, name, group, 0).context("reading group state")?;
        let current = self.current(name, group, &plan.domains);

        let observations = observe(&self.metrics, &plan.members, &group.scaling, self.settings.trailing)
            .context("reading metrics")?;
        let signal = self.policy.decide(&observations, &group.scaling);
        let target = scale_target(name, &group.scaling, current, signal, now);
        plan.target = target;

        let mut report = GroupReport {
            group: name.to_string(),
            signal,
            desired: current.desired,
            ..Default::default()
        };

        let drift = RolloutStatus::of(&plan.domains, &group.image).in_progress();
        let mut actions = plan.repairs();
        if !drift {
            actions.extend(plan.converge());
        }
        if !self.submit(actions, &mut report) {
            return Ok(report);
        }
        if drift {
            self.roll(name, group, target, &mut report).await?;
            if report.queue_full {
                return Ok(report);
            }
        }

        if target != current.desired {
            self.standing.insert(
                name.to_string(),
                GroupState {
                    desired: target,
                    last_action: Some(now),
                },
            );
            info!(group = name, desired = target, "desired size committed");
        }
        report.desired = target;
        Ok(report)
    }

    /// Enqueue in order. Returns false once the queue is full.
    fn submit(&self, actions: Vec<Action>, report: &mut GroupReport) -> bool {
        for action in actions {
            let id = action.id.clone();
            let kind = action.kind();
            match self.queue.enqueue(action) {
                Ok(Enqueued::Accepted) => report.accepted += 1,
                Ok(Enqueued::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    warn!(
                        group = %report.group,
                        id = %id,
                        %kind,
                        error = %e,
                        "action queue full, group resumes next cycle"
                    );
                    report.queue_full = true;
                    return false;
                }
            }
        }
        true
    }

    /// Step through a rolling replacement, waiting for each step to land
    /// before planning the next.
    async fn roll(
        &self,
        name: &str,
        group: &AutoscalingGroupConfig,
        target: u32,
        report: &mut GroupReport,
    ) -> Result<()> {
        loop {
            let mut plan = GroupPlan::load(&self.state, name, group, target)
                .context("reading group state")?;
            let step = plan_step(
                &plan.domains,
                &group.image,
                target,
                group.scaling.max,
                &group.replacement,
            );

            let (actions, landing) = match step {
                RolloutStep::Complete => {
                    info!(group = name, image = %group.image, "rollout complete");
                    return Ok(());
                }
                RolloutStep::Wait => {
                    debug!(group = name, "rollout waiting on previous step");
                    return Ok(());
                }
                RolloutStep::Blocked => {
                    warn!(
                        group = name,
                        max_surge = group.replacement.max_surge,
                        max_unavailable = group.replacement.max_unavailable,
                        "rollout cannot progress within surge and unavailability bounds"
                    );
                    return Ok(());
                }
                RolloutStep::Surge(count) => {
                    let actions = plan.creates(count);
                    let names = actions
                        .iter()
                        .map(|a| a.payload.domain().to_string())
                        .collect();
                    (actions, Landing::Running(names))
                }
                RolloutStep::Retire(domain) => {
                    let actions: Vec<Action> = plan.retire(&domain).into_iter().collect();
                    (actions, Landing::Gone(domain))
                }
            };

            if actions.is_empty() || !self.submit(actions, report) {
                return Ok(());
            }
            if !self
                .await_landing(name, &landing)
                .await
                .context("polling rollout step")?
            {
                debug!(group = name, ?landing, "rollout step still pending, resuming next cycle");
                return Ok(());
            }
        }
    }

    async fn await_landing(&self, group: &str, landing: &Landing) -> StateResult<bool> {
        for _ in 0..self.settings.poll_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;
            if self.landed(group, landing)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn landed(&self, group: &str, landing: &Landing) -> StateResult<bool> {
        match landing {
            Landing::Running(names) => {
                for name in names {
                    let running = self
                        .state
                        .get_domain(group, name)?
                        .is_some_and(|d| d.is_running());
                    if !running {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Landing::Gone(name) => Ok(self.state.get_domain(group, name)?.is_none()),
        }
    }

    // ── Telemetry ──────────────────────────────────────────────────

    /// Host inventory and per-group standing.
    pub fn telemetry(&self, now: u64) -> StateResult<TelemetryReport> {
        let mut hosts = Vec::new();
        for host in self.state.list_hosts()? {
            let domains = self
                .state
                .list_domains_by_host(&host.name)?
                .iter()
                .filter(|d| d.is_active())
                .count();
            hosts.push(HostSummary {
                hypervisor: host.hypervisor.to_string(),
                powered: host.powered,
                domains,
                name: host.name,
            });
        }

        let mut groups = Vec::with_capacity(self.groups.len());
        for (name, group) in &self.groups {
            let status = RolloutStatus::of(&self.state.list_domains_by_group(name)?, &group.image);
            groups.push(GroupStanding {
                name: name.clone(),
                desired: self.desired_or_configured(name, group),
                provisioned: status.total(),
                running: status.running,
                outdated: status.outdated,
            });
        }

        Ok(TelemetryReport {
            hosts,
            groups,
            timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use vmscale_actions::{ActionKind, ActionPayload};
    use vmscale_core::HostConfig;
    use vmscale_metrics::Sample;

    const GROUP: &str = "default";

    struct Fixture {
        reconciler: Reconciler,
        state: StateStore,
        metrics: MetricsStore,
        queue: Arc<ActionQueue>,
        telemetry: mpsc::Receiver<PlatformMessage>,
        image: String,
    }

    fn config(min: u32, max: u32, desired: u32) -> ControllerConfig {
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

    fn fixture(config: &ControllerConfig, capacity: usize) -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let metrics = MetricsStore::open_in_memory().unwrap();
        for host in &config.controller.autoscale.hosts {
            state.upsert_host(&HostRecord::from_config(host, 0)).unwrap();
        }
        for (name, group) in &config.controller.autoscale.groups {
            for host in &group.hosts {
                state.add_group_member(name, host).unwrap();
            }
        }
        let queue = Arc::new(ActionQueue::new(capacity));
        let (bridge, telemetry) = PlatformBridge::channel(64);
        let settings = ReconcilerSettings {
            interval: Duration::from_secs(1),
            trailing: 10,
            poll_interval: Duration::from_millis(10),
            poll_attempts: 2,
        };
        let reconciler = Reconciler::new(config, state.clone(), metrics.clone(), queue.clone(), bridge)
            .with_settings(settings);
        Fixture {
            reconciler,
            state,
            metrics,
            queue,
            telemetry,
            image: config.controller.autoscale.groups[GROUP].image.clone(),
        }
    }

    impl Fixture {
        fn domain(&self, name: &str, host: &str, image: &str, state: DomainState) {
            self.state
                .upsert_domain(&DomainRecord {
                    name: name.into(),
                    host: host.into(),
                    group: GROUP.into(),
                    image: image.into(),
                    resources: vmscale_core::Resources::new(2, 2048, 20),
                    state,
                    created_at: 0,
                    updated_at: 0,
                })
                .unwrap();
        }

        fn running(&self, names: &[&str]) {
            for name in names {
                self.domain(name, "hv-1", &self.image.clone(), DomainState::Running);
            }
        }

        fn cpu(&self, value: f64) {
            for ts in 0..5 {
                self.metrics.record("hv-1", "cpu", Sample::new(ts, value)).unwrap();
            }
        }

        async fn drain(&self) -> Vec<Action> {
            let mut actions = Vec::new();
            while !self.queue.is_empty() {
                let action = self.queue.dequeue().await;
                self.queue.complete(&action.id);
                actions.push(action);
            }
            actions
        }
    }

    #[tokio::test]
    async fn high_cpu_scales_up_once_per_cooldown() {
        let mut f = fixture(&config(2, 6, 2), 16);
        f.running(&["default-0", "default-1"]);
        f.cpu(85.0);

        let report = f.reconciler.reconcile_at(1000).await.remove(0);
        assert_eq!(report.signal, ScaleSignal::Up);
        assert_eq!(report.desired, 3);
        assert_eq!(report.accepted, 1);
        assert_eq!(f.reconciler.group_state(GROUP).unwrap().last_action, Some(1000));

        // Still hot inside the cooldown: the pending create is re-derived, nothing new.
        let report = f.reconciler.reconcile_at(1030).await.remove(0);
        assert_eq!(report.desired, 3);
        assert_eq!(report.accepted, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(f.reconciler.group_state(GROUP).unwrap().last_action, Some(1000));

        let actions = f.drain().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), ActionKind::CreateVm);
        assert_eq!(actions[0].payload.domain(), "default-2");
        f.running(&["default-2"]);

        let report = f.reconciler.reconcile_at(1059).await.remove(0);
        assert_eq!((report.desired, report.accepted), (3, 0));

        let report = f.reconciler.reconcile_at(1060).await.remove(0);
        assert_eq!((report.desired, report.accepted), (4, 1));
        assert_eq!(f.drain().await[0].payload.domain(), "default-3");
    }

    #[tokio::test]
    async fn converged_group_emits_nothing() {
        let mut f = fixture(&config(1, 4, 2), 16);
        f.running(&["default-0", "default-1"]);
        f.cpu(50.0);

        for now in [100, 200] {
            let report = f.reconciler.reconcile_at(now).await.remove(0);
            assert_eq!(report.signal, ScaleSignal::Hold);
            assert_eq!(report.accepted + report.duplicates, 0);
        }
        assert_eq!(f.queue.admitted(), 0);
    }

    #[tokio::test]
    async fn no_samples_means_no_decision() {
        let mut f = fixture(&config(1, 4, 2), 16);
        f.running(&["default-0", "default-1"]);

        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.signal, ScaleSignal::Hold);
        assert_eq!(report.desired, 2);
        assert_eq!(f.reconciler.group_state(GROUP).unwrap().last_action, None);
    }

    #[tokio::test]
    async fn bootstrap_spreads_creates_over_member_hosts() {
        let mut f = fixture(&config(1, 4, 3), 16);

        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.accepted, 3);
        let actions = f.drain().await;
        let placed: Vec<(&str, &str)> = actions
            .iter()
            .map(|a| (a.payload.domain(), a.host.as_str()))
            .collect();
        assert_eq!(
            placed,
            [("default-0", "hv-1"), ("default-1", "hv-2"), ("default-2", "hv-1")]
        );
        assert!(actions.iter().all(|a| matches!(
            &a.payload,
            ActionPayload::Create { spec } if spec.image == f.image
        )));
    }

    #[tokio::test]
    async fn full_queue_stops_group_without_burning_cooldown() {
        let mut f = fixture(&config(2, 6, 2), 1);
        f.running(&["default-0", "default-1"]);
        f.cpu(85.0);
        f.queue
            .enqueue(Action::delete("other", "hv-2", "other-0", 1))
            .unwrap();

        let report = f.reconciler.reconcile_at(1000).await.remove(0);
        assert!(report.queue_full);
        assert_eq!(report.accepted, 0);
        assert_eq!(report.desired, 2);
        assert_eq!(f.reconciler.group_state(GROUP).unwrap().last_action, None);
        assert_eq!(f.queue.admitted(), 1);

        f.drain().await;
        let report = f.reconciler.reconcile_at(1001).await.remove(0);
        assert!(!report.queue_full);
        assert_eq!((report.desired, report.accepted), (3, 1));
    }

    #[tokio::test]
    async fn scale_down_prefers_stopped_then_highest_name() {
        let mut f = fixture(&config(1, 4, 3), 16);
        f.running(&["default-0", "default-1", "default-2"]);
        f.cpu(10.0);

        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.signal, ScaleSignal::Down);
        assert_eq!(report.desired, 2);
        let actions = f.drain().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), ActionKind::DeleteVm);
        assert_eq!(actions[0].payload.domain(), "default-2");
    }

    #[tokio::test]
    async fn at_max_up_signal_is_not_a_decision() {
        let mut f = fixture(&config(1, 2, 2), 16);
        f.running(&["default-0", "default-1"]);
        f.cpu(95.0);

        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.signal, ScaleSignal::Up);
        assert_eq!((report.desired, report.accepted), (2, 0));
        assert_eq!(f.reconciler.group_state(GROUP).unwrap().last_action, None);
    }

    #[tokio::test]
    async fn repairs_power_and_placement() {
        let mut cfg = config(1, 4, 2);
        let mut spare: HostConfig = cfg.controller.autoscale.hosts[0].clone();
        spare.name = "hv-old".into();
        cfg.controller.autoscale.hosts.push(spare);
        let mut f = fixture(&cfg, 16);
        let image = f.image.clone();
        f.domain("default-0", "hv-1", &image, DomainState::Stopped);
        f.domain("default-1", "hv-old", &image, DomainState::Running);

        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.accepted, 2);
        let actions = f.drain().await;
        assert!(matches!(
            &actions[0].payload,
            ActionPayload::Power { domain, on: true } if domain == "default-0"
        ));
        assert_eq!(actions[1].host, "hv-old");
        assert!(matches!(
            &actions[1].payload,
            ActionPayload::Migrate { domain, target_host } if domain == "default-1" && target_host == "hv-2"
        ));
    }

    #[tokio::test]
    async fn drift_surges_first_and_waits_for_it() {
        let mut f = fixture(&config(1, 8, 4), 16);
        let old = "/var/lib/libvirt/images/old.qcow2";
        for i in 0..4 {
            f.domain(&format!("default-{i}"), "hv-1", old, DomainState::Running);
        }

        // Nothing executes the create, so the step never lands.
        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.accepted, 1);
        let actions = f.drain().await;
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0].payload,
            ActionPayload::Create { spec } if spec.name == "default-4" && spec.image == f.image
        ));
    }

    #[tokio::test]
    async fn fresh_reconciler_adopts_provisioned_size() {
        let mut f = fixture(&config(2, 6, 2), 16);
        f.running(&["default-0", "default-1", "default-2"]);
        f.cpu(50.0);

        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.signal, ScaleSignal::Hold);
        assert_eq!(report.desired, 3);
        assert_eq!(report.accepted + report.duplicates, 0);
        assert_eq!(f.queue.admitted(), 0);
        let standing = f.reconciler.group_state(GROUP).unwrap();
        assert_eq!((standing.desired, standing.last_action), (3, None));
    }

    #[tokio::test]
    async fn adopted_size_still_respects_bounds() {
        let mut f = fixture(&config(1, 2, 2), 16);
        f.running(&["default-0", "default-1", "default-2"]);

        let report = f.reconciler.reconcile_at(100).await.remove(0);
        assert_eq!(report.desired, 2);
        let actions = f.drain().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), ActionKind::DeleteVm);
        assert_eq!(actions[0].payload.domain(), "default-2");
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_rollout_poll() {
        let f = fixture(&config(1, 8, 4), 16);
        for i in 0..4 {
            f.domain(&format!("default-{i}"), "hv-1", "old.qcow2", DomainState::Running);
        }
        // Nothing executes the surge create, so the poll would run ~10 s.
        let mut reconciler = f.reconciler.with_settings(ReconcilerSettings {
            interval: Duration::from_secs(60),
            trailing: 10,
            poll_interval: Duration::from_millis(200),
            poll_attempts: 50,
        });
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            reconciler.run(rx).await;
            reconciler
        });

        for _ in 0..100 {
            if f.queue.admitted() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.queue.admitted(), 1);

        tx.send(true).unwrap();
        let reconciler = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run returns promptly after shutdown")
            .unwrap();
        assert_eq!(reconciler.group_state(GROUP).unwrap().desired, 4);
    }

    #[tokio::test]
    async fn telemetry_reports_standing() {
        let mut f = fixture(&config(1, 4, 2), 16);
        f.running(&["default-0"]);
        f.domain("default-1", "hv-2", "old.qcow2", DomainState::Stopped);

        f.reconciler.reconcile_at(100).await;
        let Some(PlatformMessage::Telemetry(report)) = f.telemetry.recv().await else {
            panic!("expected telemetry");
        };
        assert_eq!(report.timestamp, 100);
        assert_eq!(report.hosts.len(), 2);
        let standing = &report.groups[0];
        assert_eq!(standing.name, GROUP);
        assert_eq!(standing.desired, 2);
        assert_eq!(standing.provisioned, 2);
        assert_eq!(standing.running, 1);
        assert_eq!(standing.outdated, 1);
    }
}
