//! Action executor — drains the queue through a pool of workers.
//!
//! Per action:
//!
//! ```text
//! earlier action for host admitted? ─ yes ──► requeue(contention delay)
//! host locks free? ────────────────── no ───► requeue(contention delay)
//! already converged in state store? ─ yes ──► Succeeded (skipped)
//! mark domain provisioning / migrating / deleting
//! open connection ─► dispatch ─► close      (each bounded by the timeout)
//! persist outcome ─► release locks ─► report
//!     any failure ─► prior record restored
//!     transient error ─► requeue(backoff) until max attempts, then Failed
//!     permanent error ─► Failed
//! ```
//!
//! Each action runs in its own task, so a panicking driver only fails that
//! action: the host locks are released and the marked record restored on
//! unwind, and the queue slot is freed.
//!
//! A migration holds the locks of both its source and target host.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use vmscale_core::{ControllerConfig, HostConfig, epoch_secs};
use vmscale_hypervisor::{Connection, DriverError, DriverRegistry};
use vmscale_platform::{ActionReport, Outcome, PlatformBridge, PlatformMessage};
use vmscale_state::{DomainRecord, DomainState, HostRecord, StateStore};

use crate::action::{Action, ActionPayload, ActionState};
use crate::error::{ActionError, ActionResult};
use crate::locks::HostLocks;
use crate::queue::ActionQueue;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub contention_delay: Duration,
    /// Bound on each driver call (open, dispatch).
    pub op_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        let exec = &config.controller.executor;
        Self {
            workers: exec.workers,
            max_attempts: exec.max_attempts,
            backoff_base: Duration::from_secs(exec.backoff_base),
            backoff_cap: config.reconciliation_interval(),
            contention_delay: Duration::from_millis(exec.contention_delay_ms),
            op_timeout: config.host_connection_timeout(),
        }
    }

    /// Delay before retry number `retry` (1-based): base × 2^(retry-1), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

/// How an action ended up succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Performed,
    /// State already matched; no driver call.
    Skipped,
}

struct Shared {
    queue: Arc<ActionQueue>,
    state: StateStore,
    registry: DriverRegistry,
    locks: HostLocks,
    bridge: PlatformBridge,
    settings: ExecutorSettings,
}

#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub fn new(
        queue: Arc<ActionQueue>,
        state: StateStore,
        registry: DriverRegistry,
        bridge: PlatformBridge,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                state,
                registry,
                locks: HostLocks::new(),
                bridge,
                settings,
            }),
        }
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.shared.queue
    }

    pub fn locks(&self) -> &HostLocks {
        &self.shared.locks
    }

    /// Run the worker pool until shutdown signal.
    pub async fn run(&self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let workers = self.shared.settings.workers.max(1);
        info!(workers, "action executor started");

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            pool.spawn(async move {
                loop {
                    tokio::select! {
                        action = this.shared.queue.dequeue() => this.dispatch(action).await,
                        _ = shutdown.changed() => break,
                    }
                }
                debug!(worker, "executor worker stopped");
            });
        }
        while pool.join_next().await.is_some() {}
        info!("action executor shutting down");
    }

    /// Process one dequeued action in its own task.
    pub async fn dispatch(&self, action: Action) {
        let snapshot = action.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.process(action).await });
        if let Err(e) = handle.await {
            error!(
                id = %snapshot.id,
                kind = %snapshot.kind(),
                host = %snapshot.host,
                error = %e,
                "action worker panicked"
            );
            self.finish(&snapshot, Err(ActionError::Panicked(e.to_string())));
        }
    }

    async fn process(&self, mut action: Action) {
        let s = &self.shared;

        if s.queue.has_earlier_for_host(&action) {
            debug!(id = %action.id, host = %action.host, "earlier action for host pending, deferring");
            s.queue.requeue(action, s.settings.contention_delay);
            return;
        }
        let guard = s.locks.try_acquire_all(&action.hosts());
        let Some(guard) = guard else {
            debug!(id = %action.id, host = %action.host, "host busy, deferring");
            s.queue.requeue(action, s.settings.contention_delay);
            return;
        };
        action.state = ActionState::InFlight;

        let result = match self.converged(&action) {
            Ok(true) => Ok(Applied::Skipped),
            Ok(false) => self.apply(&action).await.map(|()| Applied::Performed),
            Err(e) => Err(e),
        };
        drop(guard);

        match result {
            Err(e) if e.is_transient() && action.attempts() < s.settings.max_attempts => {
                action.retries += 1;
                let delay = s.settings.backoff(action.retries);
                warn!(
                    id = %action.id,
                    kind = %action.kind(),
                    host = %action.host,
                    attempt = action.retries,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient action failure, retrying"
                );
                s.queue.requeue(action, delay);
            }
            result => self.finish(&action, result),
        }
    }

    /// True if the state store already reflects the action's effect.
    fn converged(&self, action: &Action) -> ActionResult<bool> {
        let state = &self.shared.state;
        let converged = match &action.payload {
            ActionPayload::Create { spec } => state
                .get_domain(&action.group, &spec.name)?
                .is_some_and(|d| {
                    d.is_active() && d.state != DomainState::Provisioning && d.image == spec.image
                }),
            ActionPayload::Delete { domain } => state.get_domain(&action.group, domain)?.is_none(),
            ActionPayload::Migrate {
                domain,
                target_host,
            } => state
                .get_domain(&action.group, domain)?
                .is_none_or(|d| &d.host == target_host),
            ActionPayload::Power { domain, on } => {
                let wanted = power_state(*on);
                state
                    .get_domain(&action.group, domain)?
                    .is_some_and(|d| d.state == wanted)
            }
        };
        Ok(converged)
    }

    async fn apply(&self, action: &Action) -> ActionResult<()> {
        let s = &self.shared;
        let record = s
            .state
            .get_host(&action.host)?
            .ok_or_else(|| ActionError::UnknownHost(action.host.clone()))?;
        let target = match &action.payload {
            ActionPayload::Migrate { target_host, .. } => Some(
                s.state
                    .get_host(target_host)?
                    .ok_or_else(|| ActionError::UnknownHost(target_host.clone()))?
                    .to_config(),
            ),
            _ => None,
        };
        let host = record.to_config();
        let driver = s.registry.resolve(record.hypervisor)?;
        let limit = s.settings.op_timeout;

        let transition = Transition::mark(&s.state, action)?;
        let mut conn = timeout(limit, driver.open(&host))
            .await
            .map_err(|_| timed_out("open", &host))??;
        let outcome = timeout(limit, invoke(conn.as_mut(), action, target.as_ref()))
            .await
            .map_err(|_| timed_out(action.kind().as_str(), &host))
            .and_then(|r| r);
        conn.close().await;
        outcome?;

        self.persist(action, record)?;
        if let Some(transition) = transition {
            transition.commit();
        }
        Ok(())
    }

    /// Record the effect of a successful driver call.
    fn persist(&self, action: &Action, mut host: HostRecord) -> ActionResult<()> {
        let state = &self.shared.state;
        let now = epoch_secs();

        match &action.payload {
            ActionPayload::Create { spec } => {
                state.upsert_domain(&DomainRecord {
                    name: spec.name.clone(),
                    host: action.host.clone(),
                    group: action.group.clone(),
                    image: spec.image.clone(),
                    resources: spec.resources,
                    state: DomainState::Running,
                    created_at: now,
                    updated_at: now,
                })?;
            }
            ActionPayload::Delete { domain } => {
                state.delete_domain(&action.group, domain)?;
            }
            ActionPayload::Migrate {
                domain,
                target_host,
            } => {
                if let Some(mut record) = state.get_domain(&action.group, domain)? {
                    record.host = target_host.clone();
                    record.state = DomainState::Running;
                    record.updated_at = now;
                    state.upsert_domain(&record)?;
                }
            }
            ActionPayload::Power { domain, on } => {
                if let Some(mut record) = state.get_domain(&action.group, domain)? {
                    record.state = power_state(*on);
                    record.updated_at = now;
                    state.upsert_domain(&record)?;
                }
            }
        }

        host.powered = true;
        host.updated_at = now;
        state.upsert_host(&host)?;
        Ok(())
    }

    /// Terminal bookkeeping: report upstream, then free the slot.
    fn finish(&self, action: &Action, result: ActionResult<Applied>) {
        let s = &self.shared;
        let (state, error, skipped) = match &result {
            Ok(applied) => (ActionState::Succeeded, None, *applied == Applied::Skipped),
            Err(e) => (ActionState::Failed, Some(e.to_string()), false),
        };
        match &error {
            None => info!(
                id = %action.id,
                kind = %action.kind(),
                host = %action.host,
                group = %action.group,
                domain = %action.payload.domain(),
                attempts = action.attempts(),
                skipped,
                "action succeeded"
            ),
            Some(e) => warn!(
                id = %action.id,
                kind = %action.kind(),
                host = %action.host,
                group = %action.group,
                domain = %action.payload.domain(),
                attempts = action.attempts(),
                error = %e,
                "action failed"
            ),
        }

        s.bridge.publish(PlatformMessage::ActionResult(ActionReport {
            action_id: action.id.to_string(),
            kind: action.kind().to_string(),
            host: action.host.clone(),
            group: action.group.clone(),
            outcome: if state == ActionState::Succeeded {
                Outcome::Succeeded
            } else {
                Outcome::Failed
            },
            error,
            attempts: action.attempts(),
            skipped,
            timestamp: epoch_secs(),
        }));
        s.queue.complete(&action.id);
    }
}

/// A domain record moved into its in-between state for the driver call.
///
/// Dropping it without `commit` puts the prior record back, or removes the
/// record if the action was creating it.
struct Transition {
    state: StateStore,
    group: String,
    domain: String,
    prior: Option<DomainRecord>,
    committed: bool,
}

impl Transition {
    fn mark(state: &StateStore, action: &Action) -> ActionResult<Option<Self>> {
        let domain = action.payload.domain();
        let prior = state.get_domain(&action.group, domain)?;
        let now = epoch_secs();
        let marked = match (&action.payload, &prior) {
            (ActionPayload::Create { spec }, _) => DomainRecord {
                name: spec.name.clone(),
                host: action.host.clone(),
                group: action.group.clone(),
                image: spec.image.clone(),
                resources: spec.resources,
                state: DomainState::Provisioning,
                created_at: now,
                updated_at: now,
            },
            (ActionPayload::Delete { .. }, Some(record)) => DomainRecord {
                state: DomainState::Deleting,
                updated_at: now,
                ..record.clone()
            },
            (ActionPayload::Migrate { .. }, Some(record)) => DomainRecord {
                state: DomainState::Migrating,
                updated_at: now,
                ..record.clone()
            },
            _ => return Ok(None),
        };
        state.upsert_domain(&marked)?;
        Ok(Some(Self {
            state: state.clone(),
            group: action.group.clone(),
            domain: domain.to_string(),
            prior,
            committed: false,
        }))
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let restored = match &self.prior {
            Some(record) => self.state.upsert_domain(record),
            None => self.state.delete_domain(&self.group, &self.domain).map(|_| ()),
        };
        if let Err(e) = restored {
            warn!(group = %self.group, domain = %self.domain, error = %e, "could not restore domain record");
        }
    }
}

async fn invoke(
    conn: &mut dyn Connection,
    action: &Action,
    target: Option<&HostConfig>,
) -> ActionResult<()> {
    let result = match &action.payload {
        ActionPayload::Create { spec } => match conn.create_vm(spec).await {
            Err(DriverError::AlreadyExists(_)) => Ok(()),
            other => other,
        },
        ActionPayload::Delete { domain } => match conn.delete_vm(domain).await {
            Err(DriverError::NotFound(_)) => Ok(()),
            other => other,
        },
        ActionPayload::Migrate {
            domain,
            target_host,
        } => match target {
            Some(target) => conn.migrate_vm(domain, target).await,
            None => return Err(ActionError::UnknownHost(target_host.clone())),
        },
        ActionPayload::Power { domain, on } => conn.set_power(domain, *on).await,
    };
    Ok(result?)
}

fn power_state(on: bool) -> DomainState {
    if on {
        DomainState::Running
    } else {
        DomainState::Stopped
    }
}

fn timed_out(operation: &str, host: &HostConfig) -> ActionError {
    ActionError::Driver(DriverError::Timeout {
        operation: format!("{operation} on {}", host.name),
    })
}
