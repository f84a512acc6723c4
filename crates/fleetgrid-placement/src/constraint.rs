//! Placement constraints — hard filters on candidate instances.

use fleetgrid_core::PlacementConstraint;
use fleetgrid_state::InstanceRecord;

use crate::placer::PlacementContext;

/// Whether `instance` may host another task given `constraint`.
pub fn satisfies(
    constraint: &PlacementConstraint,
    instance: &InstanceRecord,
    ctx: &PlacementContext,
) -> bool {
    match constraint {
        PlacementConstraint::DistinctInstance => ctx.service_tasks_on(&instance.id) == 0,
        PlacementConstraint::MemberOf { attribute, values } => instance
            .attribute(attribute)
            .is_some_and(|value| values.iter().any(|v| v == value)),
    }
}

/// Constraints that depend only on the instance, not on current placements.
///
/// An instance failing a static constraint can never host the task; one
/// failing a dynamic constraint might once tasks move.
pub fn is_static(constraint: &PlacementConstraint) -> bool {
    matches!(constraint, PlacementConstraint::MemberOf { .. })
}

/// Whether `instance` passes every constraint in `constraints`.
pub fn satisfies_all(
    constraints: &[PlacementConstraint],
    instance: &InstanceRecord,
    ctx: &PlacementContext,
) -> bool {
    constraints.iter().all(|c| satisfies(c, instance, ctx))
}
