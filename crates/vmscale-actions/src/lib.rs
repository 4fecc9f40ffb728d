//! vmscale-actions — the action pipeline between reconciler and hypervisors.
//!
//! # Architecture
//!
//! ```text
//! Reconciler ──enqueue──► ActionQueue (bounded, dedup by ActionId)
//!                              │ dequeue / requeue / complete
//!                              ▼
//!                         Executor (worker pool)
//!                           ├── HostLocks (one action per host)
//!                           ├── DriverRegistry → Connection
//!                           ├── StateStore (convergence check, persist)
//!                           └── PlatformBridge (ActionResult)
//! ```

pub mod action;
pub mod error;
pub mod executor;
pub mod locks;
pub mod queue;

pub use action::{Action, ActionId, ActionKind, ActionPayload, ActionState};
pub use error::{ActionError, ActionResult, QueueError};
pub use executor::{Executor, ExecutorSettings};
pub use locks::HostLocks;
pub use queue::{ActionQueue, Enqueued};
