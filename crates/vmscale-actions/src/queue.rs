//! Bounded action queue.
//!
//! Capacity counts *admitted* actions, waiting or in flight, so a requeue
//! never needs room of its own. An action stays admitted from `enqueue`
//! until `complete`. For that whole span its id is a deduplication key, and
//! so is the (group, domain, kind) triple: a re-derived action placed on a
//! different host must not run next to the one already admitted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::action::{Action, ActionId, ActionKind, ActionState};
use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// An action with the same id, or of the same kind for the same
    /// domain, is already admitted.
    Duplicate,
}

struct Waiting {
    action: Action,
    ready_at: Instant,
}

struct Admitted {
    host: String,
    group: String,
    domain: String,
    kind: ActionKind,
    seq: u64,
    in_flight: bool,
}

impl Admitted {
    fn same_intent(&self, action: &Action) -> bool {
        self.kind == action.kind()
            && self.group == action.group
            && self.domain == action.payload.domain()
    }
}

#[derive(Default)]
struct Inner {
    waiting: VecDeque<Waiting>,
    admitted: HashMap<ActionId, Admitted>,
    next_seq: u64,
}

pub struct ActionQueue {
    inner: Mutex<Inner>,
    ready: Notify,
    capacity: usize,
}

impl ActionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit an action without blocking.
    pub fn enqueue(&self, mut action: Action) -> Result<Enqueued, QueueError> {
        let mut inner = self.lock();
        if inner.admitted.contains_key(&action.id)
            || inner.admitted.values().any(|a| a.same_intent(&action))
        {
            debug!(
                id = %action.id,
                kind = %action.kind(),
                domain = %action.payload.domain(),
                "duplicate action ignored"
            );
            return Ok(Enqueued::Duplicate);
        }
        if inner.admitted.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        action.seq = inner.next_seq;
        inner.next_seq += 1;
        action.state = ActionState::Pending;
        inner.admitted.insert(
            action.id.clone(),
            Admitted {
                host: action.host.clone(),
                group: action.group.clone(),
                domain: action.payload.domain().to_string(),
                kind: action.kind(),
                seq: action.seq,
                in_flight: false,
            },
        );
        debug!(
            id = %action.id,
            kind = %action.kind(),
            host = %action.host,
            group = %action.group,
            seq = action.seq,
            "action enqueued"
        );
        inner.waiting.push_back(Waiting {
            action,
            ready_at: Instant::now(),
        });
        drop(inner);
        self.ready.notify_one();
        Ok(Enqueued::Accepted)
    }

    /// Wait for the oldest ready action and mark it in flight.
    pub async fn dequeue(&self) -> Action {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready_at = {
                let mut inner = self.lock();
                let now = Instant::now();
                if let Some(pos) = inner.waiting.iter().position(|w| w.ready_at <= now)
                    && let Some(Waiting { mut action, .. }) = inner.waiting.remove(pos)
                {
                    if let Some(slot) = inner.admitted.get_mut(&action.id) {
                        slot.in_flight = true;
                    }
                    action.state = ActionState::InFlight;
                    return action;
                }
                inner.waiting.iter().map(|w| w.ready_at).min()
            };

            match next_ready_at {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Put an in-flight action back, ready after `delay`.
    pub fn requeue(&self, mut action: Action, delay: Duration) {
        let mut inner = self.lock();
        let Some(slot) = inner.admitted.get_mut(&action.id) else {
            debug!(id = %action.id, "requeue of unadmitted action ignored");
            return;
        };
        slot.in_flight = false;
        action.state = ActionState::Pending;
        inner.waiting.push_back(Waiting {
            action,
            ready_at: Instant::now() + delay,
        });
        drop(inner);
        self.ready.notify_one();
    }

    /// Forget a terminal action, freeing its slot.
    pub fn complete(&self, id: &ActionId) {
        let mut inner = self.lock();
        inner.admitted.remove(id);
        inner.waiting.retain(|w| &w.action.id != id);
    }

    /// True if an action for the same host was admitted earlier and has not
    /// completed yet, whether it is waiting or in flight.
    ///
    /// The oldest admitted action of a host never sees one, so per-host
    /// order is kept without starving anybody.
    pub fn has_earlier_for_host(&self, action: &Action) -> bool {
        self.lock()
            .admitted
            .values()
            .any(|a| a.host == action.host && a.seq < action.seq)
    }

    /// Actions handed out by `dequeue` and not yet requeued or completed.
    pub fn in_flight(&self) -> usize {
        self.lock().admitted.values().filter(|a| a.in_flight).count()
    }

    pub fn is_admitted(&self, id: &ActionId) -> bool {
        self.lock().admitted.contains_key(id)
    }

    /// Actions waiting to run.
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Actions waiting or in flight.
    pub fn admitted(&self) -> usize {
        self.lock().admitted.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
