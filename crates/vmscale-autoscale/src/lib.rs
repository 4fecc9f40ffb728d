//! vmscale-autoscale — the reconciler.
//!
//! Once per reconciliation interval every autoscaling group is compared
//! against its declared shape and the difference is enqueued as actions.
//!
//! # Components
//!
//! - **Policy** — [`DecisionPolicy`] turns aggregated utilization into a
//!   scale signal; [`ThresholdPolicy`] is the default.
//! - **Placement** — lowest free domain names, capacity-aware host choice,
//!   and scale-down victim order.
//! - **Reconciler** — cooldowns, convergence, repairs, rolling replacement
//!   and the per-cycle telemetry event.

pub mod placement;
pub mod policy;
pub mod reconciler;

pub use placement::{Names, Placement, domain_name, victims};
pub use policy::{DecisionPolicy, Observation, ScaleSignal, ThresholdPolicy, observe};
pub use reconciler::{GroupReport, GroupState, Reconciler, ReconcilerSettings};
