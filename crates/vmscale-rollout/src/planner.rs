//! Rolling replacement planner.
//!
//! Pure function of a group's domains and its declared shape; the
//! reconciler turns the returned step into actions and calls again once
//! they have landed.

use std::cmp::Ordering;

use tracing::debug;
use vmscale_core::HostReplacementStrategy;
use vmscale_state::DomainRecord;

/// Counts over a group's active domains, split by image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloutStatus {
    /// Active domains running a stale image.
    pub outdated: u32,
    /// Active domains on the declared image.
    pub current: u32,
    /// Current-image domains in the running state.
    pub current_running: u32,
    /// Running domains of either image.
    pub running: u32,
}

impl RolloutStatus {
    pub fn of(domains: &[DomainRecord], image: &str) -> Self {
        let mut status = Self::default();
        for d in domains.iter().filter(|d| d.is_active()) {
            if d.image == image {
                status.current += 1;
                if d.is_running() {
                    status.current_running += 1;
                }
            } else {
                status.outdated += 1;
            }
            if d.is_running() {
                status.running += 1;
            }
        }
        status
    }

    pub fn total(&self) -> u32 {
        self.current + self.outdated
    }

    pub fn in_progress(&self) -> bool {
        self.outdated > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStep {
    /// Nothing on a stale image.
    Complete,
    /// Create this many current-image domains.
    Surge(u32),
    /// Delete this outdated domain.
    Retire(String),
    /// A previous step has not converged yet.
    Wait,
    /// Neither a surge nor a retirement fits the configured bounds.
    Blocked,
}

/// Decide the next replacement step for a group.
///
/// `max` is the group's hard size limit; the surge ceiling is
/// `min(desired + maxSurge, max)`. A domain is only retired once every
/// current-image domain is running and the group keeps at least
/// `desired - maxUnavailable` running domains afterwards.
pub fn plan_step(
    domains: &[DomainRecord],
    image: &str,
    desired: u32,
    max: u32,
    strategy: &HostReplacementStrategy,
) -> RolloutStep {
    let status = RolloutStatus::of(domains, image);
    if !status.in_progress() {
        return RolloutStep::Complete;
    }

    let ceiling = desired.saturating_add(strategy.max_surge).min(max);
    let creates = desired
        .saturating_sub(status.current)
        .min(ceiling.saturating_sub(status.total()));
    if creates > 0 {
        debug!(image, creates, ?status, "rollout surge");
        return RolloutStep::Surge(creates);
    }

    if status.current_running < status.current {
        return RolloutStep::Wait;
    }

    let Some(victim) = pick_outdated(domains, image) else {
        return RolloutStep::Wait;
    };
    let floor = desired.saturating_sub(strategy.max_unavailable);
    let running_after = status.running - u32::from(victim.is_running());
    if running_after >= floor {
        debug!(image, domain = %victim.name, ?status, "rollout retire");
        return RolloutStep::Retire(victim.name.clone());
    }

    // With nothing surging and nothing in flight, waiting cannot help.
    if ceiling <= status.total() && status.running == status.total() {
        RolloutStep::Blocked
    } else {
        RolloutStep::Wait
    }
}

/// Non-running outdated domains go first, then the highest name
/// (`web-10` sorts after `web-9`).
fn pick_outdated<'a>(domains: &'a [DomainRecord], image: &str) -> Option<&'a DomainRecord> {
    domains
        .iter()
        .filter(|d| d.is_active() && d.image != image)
        .max_by(|a, b| match (a.is_running(), b.is_running()) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            _ => a.name.len().cmp(&b.name.len()).then_with(|| a.name.cmp(&b.name)),
        })
}
