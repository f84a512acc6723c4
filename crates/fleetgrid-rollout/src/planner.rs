//! Batch sizing for rolling replacement.
//!
//! The policy bounds how many tasks may be running at once:
//!
//! ```text
//! lower = floor(desired * minimum_healthy_percent / 100)   healthy floor
//! upper = ceil(desired * maximum_percent / 100)            active ceiling
//! ```
//!
//! Each batch stops old tasks down to the floor, then starts new tasks up
//! to the ceiling.

use fleetgrid_core::DeploymentPolicy;

use crate::error::DeploymentFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBounds {
    /// Healthy running tasks that must remain at all times.
    pub lower: u32,
    /// Maximum active (pending or running) tasks at any time.
    pub upper: u32,
}

pub fn bounds(desired: u32, policy: &DeploymentPolicy) -> BatchBounds {
    let desired = u64::from(desired);
    let lower = desired * u64::from(policy.minimum_healthy_percent) / 100;
    let upper = (desired * u64::from(policy.maximum_percent)).div_ceil(100);
    BatchBounds {
        lower: lower.min(u64::from(u32::MAX)) as u32,
        upper: upper.min(u64::from(u32::MAX)) as u32,
    }
}

/// Reject policies under which a batch could never move a task.
pub fn validate(desired: u32, policy: &DeploymentPolicy) -> Result<BatchBounds, DeploymentFailure> {
    let b = bounds(desired, policy);
    let invalid = desired > 0 && (b.upper <= b.lower || policy.maximum_percent < 100);
    if invalid {
        return Err(DeploymentFailure::InvalidPolicy {
            desired,
            minimum_healthy_percent: policy.minimum_healthy_percent,
            maximum_percent: policy.maximum_percent,
        });
    }
    Ok(b)
}

/// Task counts the planner needs, split by revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    /// Old-revision tasks that are pending or running.
    pub old_active: u32,
    /// New-revision tasks that are pending or running.
    pub new_active: u32,
    /// Running tasks of either revision that pass their health check.
    pub healthy_running: u32,
    /// New-revision tasks among `healthy_running`.
    pub new_healthy: u32,
}

impl TaskCounts {
    pub fn active(&self) -> u32 {
        self.old_active + self.new_active
    }

    /// Every desired task runs the new revision and nothing old is left.
    pub fn is_complete(&self, desired: u32) -> bool {
        self.old_active == 0 && self.new_healthy >= desired
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchPlan {
    /// Old tasks to stop.
    pub stop: u32,
    /// New tasks to start.
    pub start: u32,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.stop == 0 && self.start == 0
    }
}

/// Size the next batch.
pub fn plan_batch(desired: u32, bounds: BatchBounds, counts: &TaskCounts) -> BatchPlan {
    let stop = counts
        .old_active
        .min(counts.healthy_running.saturating_sub(bounds.lower));
    let remaining = counts.active() - stop;
    let start = desired
        .saturating_sub(counts.new_active)
        .min(bounds.upper.saturating_sub(remaining));
    BatchPlan { stop, start }
}
