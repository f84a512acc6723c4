//! Pure capacity decision over a utilization snapshot.

use tracing::debug;

use fleetgrid_core::{CapacityProviderSpec, InstanceId, Resources};
use fleetgrid_state::InstanceStatus;

/// One instance as seen by the capacity scaler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUsage {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub active_tasks: u32,
    pub available: Resources,
    /// Unix timestamp (seconds) of launch.
    pub launched_at: u64,
    pub protected: bool,
}

impl InstanceUsage {
    pub fn is_busy(&self) -> bool {
        self.active_tasks > 0
    }
}

/// Instances in the group plus the resource requirements of every
/// PENDING task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterUtilization {
    pub instances: Vec<InstanceUsage>,
    pub pending: Vec<Resources>,
}

impl ClusterUtilization {
    /// In-service group size. Draining instances are already on their way
    /// out and do not count.
    pub fn current(&self) -> u32 {
        self.in_service().count() as u32
    }

    fn in_service(&self) -> impl Iterator<Item = &InstanceUsage> {
        self.instances
            .iter()
            .filter(|i| i.status == InstanceStatus::InService)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingAction {
    /// Add this many instances.
    ScaleOut(u32),
    /// Drain and remove these instances.
    ScaleIn { instances: Vec<InstanceId> },
    NoAction,
}

/// Decide how the group should change.
pub fn reconcile(spec: &CapacityProviderSpec, utilization: &ClusterUtilization) -> ScalingAction {
    let current = utilization.current();
    let busy = utilization.in_service().filter(|i| i.is_busy()).count() as u32;
    let extra = instances_for_pending(spec, utilization);
    let required = busy + extra;

    let percent = spec.target_capacity_percent.clamp(1, 100);
    let mut target = (required * 100).div_ceil(percent);
    if !utilization.pending.is_empty() && required == 0 {
        target = target.max(1);
    }
    let max_size = spec.max_size.max(spec.min_size);
    let target = target.clamp(spec.min_size, max_size);

    debug!(current, busy, extra, target, "capacity evaluated");

    let (min_step, max_step) = (spec.min_step.max(1), spec.max_step.max(spec.min_step.max(1)));

    if target > current {
        let step = (target - current)
            .clamp(min_step, max_step)
            .min(max_size.saturating_sub(current));
        return if step == 0 {
            ScalingAction::NoAction
        } else {
            ScalingAction::ScaleOut(step)
        };
    }

    if target < current {
        let step = (current - target)
            .clamp(min_step, max_step)
            .min(current.saturating_sub(spec.min_size));
        let instances = scale_in_candidates(utilization)
            .into_iter()
            .take(step as usize)
            .collect::<Vec<_>>();
        return if instances.is_empty() {
            ScalingAction::NoAction
        } else {
            ScalingAction::ScaleIn { instances }
        };
    }

    ScalingAction::NoAction
}

/// Instances that scale-in may remove, best candidate first: in service,
/// not (protected and busy), fewest tasks, oldest launch, lowest id.
pub fn scale_in_candidates(utilization: &ClusterUtilization) -> Vec<InstanceId> {
    let mut candidates: Vec<&InstanceUsage> = utilization
        .instances
        .iter()
        .filter(|i| i.status == InstanceStatus::InService)
        .filter(|i| !(i.protected && i.is_busy()))
        .collect();
    candidates.sort_by(|a, b| {
        a.active_tasks
            .cmp(&b.active_tasks)
            .then(a.launched_at.cmp(&b.launched_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.into_iter().map(|i| i.id.clone()).collect()
}

/// Pack the pending backlog first-fit-decreasing onto free capacity, then
/// onto fresh template-sized instances. Returns the number of instances
/// that are not busy today but would be after packing.
fn instances_for_pending(spec: &CapacityProviderSpec, utilization: &ClusterUtilization) -> u32 {
    if utilization.pending.is_empty() {
        return 0;
    }

    let template = spec.instance_resources();
    let mut bins: Vec<(Resources, bool)> = utilization
        .instances
        .iter()
        .filter(|i| i.status == InstanceStatus::InService)
        .map(|i| (i.available, !i.is_busy()))
        .collect();
    let existing = bins.len();

    let mut pending = utilization.pending.clone();
    pending.sort_by(|a, b| (b.memory, b.cpu).cmp(&(a.memory, a.cpu)));

    let mut newly_used = vec![false; existing];
    for req in &pending {
        if !req.fits_within(&template) && !bins.iter().any(|(free, _)| req.fits_within(free)) {
            debug!(requirements = %req, "pending task fits no instance size; ignored");
            continue;
        }
        match bins.iter().position(|(free, _)| req.fits_within(free)) {
            Some(idx) => {
                bins[idx].0 = bins[idx].0.saturating_sub(req);
                if idx < existing && bins[idx].1 {
                    newly_used[idx] = true;
                }
            }
            None => bins.push((template.saturating_sub(req), true)),
        }
    }

    let fresh = (bins.len() - existing) as u32;
    let idle_filled = newly_used.iter().filter(|used| **used).count() as u32;
    fresh + idle_filled
}
