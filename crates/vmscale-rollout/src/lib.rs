//! vmscale-rollout — rolling image replacement for autoscaling groups.
//!
//! When a group's declared image changes, existing domains are replaced one
//! step at a time. Each call to [`plan_step`] looks at the group's current
//! domains and returns the next step:
//!
//! ```text
//! new-image domains < desired and room under min(desired + maxSurge, max)
//!     → Surge(n)         create n new-image domains
//! every new-image domain running and running stays ≥ desired − maxUnavailable
//!     → Retire(domain)   delete one old-image domain
//! otherwise
//!     → Wait             let the previous step converge
//! no old-image domains left
//!     → Complete
//! ```

pub mod planner;

pub use planner::{RolloutStatus, RolloutStep, plan_step};
