//! Placement decision — picks one instance for one task.
//!
//! Given a snapshot of registered instances, the placer:
//! 1. Drops instances that are not in service
//! 2. Applies constraints as hard filters
//! 3. Drops instances without enough available resources (or host port)
//! 4. Narrows the rest through each strategy in order
//! 5. Tie-breaks on instance id
//!
//! The decision is pure and deterministic. Reserving the resources is
//! the engine's job.

use std::collections::HashMap;

use fleetgrid_core::{InstanceId, PlacementConstraint, PlacementStrategy, Resources};
use fleetgrid_state::InstanceRecord;
use tracing::debug;

use crate::constraint;
use crate::error::{FailureReason, PlacementFailure};
use crate::strategy;

/// What is being placed.
#[derive(Debug, Clone)]
pub struct PlacementRequest<'a> {
    pub service: &'a str,
    pub requirements: Resources,
    /// The task exposes a container port and needs a dynamic host port.
    pub needs_host_port: bool,
}

/// Current placements of the service being placed.
#[derive(Debug, Clone, Default)]
pub struct PlacementContext {
    service_tasks: HashMap<InstanceId, u32>,
}

impl PlacementContext {
    /// Build from per-instance task counts of the service.
    pub fn from_counts(counts: impl IntoIterator<Item = (InstanceId, u32)>) -> Self {
        Self {
            service_tasks: counts.into_iter().collect(),
        }
    }

    /// Tasks of the service currently placed on `instance_id`.
    pub fn service_tasks_on(&self, instance_id: &str) -> u32 {
        self.service_tasks.get(instance_id).copied().unwrap_or(0)
    }

    /// Record a placement, for callers placing several tasks off one snapshot.
    pub fn record(&mut self, instance_id: &str) {
        *self.service_tasks.entry(instance_id.to_string()).or_insert(0) += 1;
    }
}

/// Choose the instance that should host the task.
pub fn place(
    request: &PlacementRequest<'_>,
    instances: &[InstanceRecord],
    strategies: &[PlacementStrategy],
    constraints: &[PlacementConstraint],
    ctx: &PlacementContext,
) -> Result<InstanceId, PlacementFailure> {
    let fail = |reason| PlacementFailure {
        service: request.service.to_string(),
        requirements: request.requirements,
        reason,
    };

    // Could any instance ever host this task, ignoring current load?
    if !instances.is_empty() {
        let mut statically_allowed = instances
            .iter()
            .filter(|i| {
                constraints
                    .iter()
                    .filter(|c| constraint::is_static(c))
                    .all(|c| constraint::satisfies(c, i, ctx))
            })
            .peekable();
        if statically_allowed.peek().is_none() {
            return Err(fail(FailureReason::ConstraintViolation(
                "no registered instance satisfies the placement constraints".to_string(),
            )));
        }
        if !statically_allowed.any(|i| request.requirements.fits_within(&i.total)) {
            return Err(fail(FailureReason::ConstraintViolation(format!(
                "no eligible instance has {} in total",
                request.requirements
            ))));
        }
    }

    let mut candidates: Vec<&InstanceRecord> = instances
        .iter()
        .filter(|i| i.is_schedulable())
        .filter(|i| constraint::satisfies_all(constraints, i, ctx))
        .filter(|i| request.requirements.fits_within(&i.available))
        .filter(|i| !request.needs_host_port || i.next_free_port().is_some())
        .collect();

    if candidates.is_empty() {
        debug!(
            service = request.service,
            requirements = %request.requirements,
            instances = instances.len(),
            "no instance has room"
        );
        return Err(fail(FailureReason::InsufficientCapacity));
    }

    for s in strategies {
        candidates = strategy::apply(s, candidates, instances, request.requirements, ctx);
    }

    let chosen = candidates
        .into_iter()
        .min_by(|a, b| a.id.cmp(&b.id))
        .map(|i| i.id.clone())
        .ok_or_else(|| fail(FailureReason::InsufficientCapacity))?;

    debug!(service = request.service, instance = %chosen, "placement chosen");
    Ok(chosen)
}
