//! Placement strategies — successive narrowing passes over candidates.
//!
//! Each pass keeps only the best-ranked candidates and hands them to the
//! next. Whatever survives every pass is tie-broken by instance id.

use std::collections::BTreeMap;

use fleetgrid_core::{PlacementField, PlacementStrategy, ResourceKind, Resources};
use fleetgrid_state::InstanceRecord;

use crate::placer::PlacementContext;

/// Run one strategy pass.
///
/// `registered` is every instance in the cluster (any status); spread
/// counts tasks across all of them, not just the remaining candidates.
pub fn apply<'a>(
    strategy: &PlacementStrategy,
    candidates: Vec<&'a InstanceRecord>,
    registered: &[InstanceRecord],
    requirements: Resources,
    ctx: &PlacementContext,
) -> Vec<&'a InstanceRecord> {
    match strategy {
        PlacementStrategy::Spread { field } => spread(field, candidates, registered, ctx),
        PlacementStrategy::Binpack { resource } => binpack(*resource, candidates, requirements),
    }
}

/// Keep the candidates in the `field` group hosting the fewest of the
/// service's tasks. Instances without the attribute group under `""`.
pub fn spread<'a>(
    field: &PlacementField,
    candidates: Vec<&'a InstanceRecord>,
    registered: &[InstanceRecord],
    ctx: &PlacementContext,
) -> Vec<&'a InstanceRecord> {
    let mut group_tasks: BTreeMap<&str, u32> = BTreeMap::new();
    for instance in registered {
        let key = instance.attribute(field).unwrap_or("");
        *group_tasks.entry(key).or_insert(0) += ctx.service_tasks_on(&instance.id);
    }

    let best = candidates
        .iter()
        .map(|i| {
            let key = i.attribute(field).unwrap_or("");
            (group_tasks.get(key).copied().unwrap_or(0), key)
        })
        .min();
    let Some((_, best_key)) = best else {
        return candidates;
    };
    let best_key = best_key.to_string();

    candidates
        .into_iter()
        .filter(|i| i.attribute(field).unwrap_or("") == best_key)
        .collect()
}

/// Keep the candidates left with the least of `resource` after placing.
pub fn binpack<'a>(
    resource: ResourceKind,
    candidates: Vec<&'a InstanceRecord>,
    requirements: Resources,
) -> Vec<&'a InstanceRecord> {
    let remaining = |i: &InstanceRecord| {
        i.available
            .get(resource)
            .saturating_sub(requirements.get(resource))
    };
    let Some(least) = candidates.iter().map(|i| remaining(i)).min() else {
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|i| remaining(i) == least)
        .collect()
}
