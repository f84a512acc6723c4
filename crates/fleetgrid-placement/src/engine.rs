//! PlacementEngine — registry-backed placement with reservation.
//!
//! Each attempt snapshots the registry, runs [`place`], and reserves the
//! task's resources on the chosen instance. A reservation that no longer
//! fits (the instance changed since the snapshot) triggers a re-plan; a
//! contended instance is retried with exponential backoff.
//!
//! Per-service counts come from the instance records themselves, so a
//! reservation still in flight for another task already counts against
//! `DistinctInstance` and spread.

use std::time::Duration;

use fleetgrid_core::{PlacementConstraint, ServiceSpec};
use fleetgrid_state::{ClusterRegistry, RegistryError, Reservation, ReservationRequest, TaskRecord};
use tracing::{debug, info};

use crate::error::{FailureReason, PlacementError, PlacementFailure};
use crate::placer::{PlacementContext, PlacementRequest, place};

/// Retry bounds for contended or stale reservations.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(500),
            max_attempts: 8,
        }
    }
}

/// Places tasks onto instances tracked by a [`ClusterRegistry`].
#[derive(Clone)]
pub struct PlacementEngine {
    registry: ClusterRegistry,
    backoff: BackoffPolicy,
}

impl PlacementEngine {
    pub fn new(registry: ClusterRegistry) -> Self {
        Self::with_backoff(registry, BackoffPolicy::default())
    }

    pub fn with_backoff(registry: ClusterRegistry, backoff: BackoffPolicy) -> Self {
        Self { registry, backoff }
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Choose an instance for `task` under `service`'s placement rules and
    /// reserve its resources there.
    pub async fn reserve(
        &self,
        task: &TaskRecord,
        service: &ServiceSpec,
    ) -> Result<Reservation, PlacementError> {
        let request = PlacementRequest {
            service: &service.name,
            requirements: task.requirements,
            needs_host_port: task.container_port.is_some(),
        };
        let mut claim = ReservationRequest::new(service.name.clone(), task.requirements);
        if request.needs_host_port {
            claim = claim.with_host_port();
        }
        if service
            .placement_constraints
            .contains(&PlacementConstraint::DistinctInstance)
        {
            claim = claim.exclusive();
        }
        let mut delay = self.backoff.initial;
        let mut last_contended = None;

        for attempt in 1..=self.backoff.max_attempts {
            let instances = self.registry.instances().await;
            let ctx = PlacementContext::from_counts(
                instances
                    .iter()
                    .map(|i| (i.id.clone(), i.tasks_of(&service.name))),
            );
            let target = place(
                &request,
                &instances,
                &service.placement_strategies,
                &service.placement_constraints,
                &ctx,
            )?;

            match self
                .registry
                .try_reserve(&target, &claim)
                .await
            {
                Ok(reservation) => return Ok(reservation),
                Err(RegistryError::Contended(instance)) => {
                    debug!(
                        task = %task.id,
                        %instance,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "instance contended, backing off"
                    );
                    last_contended = Some(instance);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.backoff.max);
                }
                Err(
                    e @ (RegistryError::InsufficientResources { .. }
                    | RegistryError::NotSchedulable { .. }
                    | RegistryError::NoFreePort(_)
                    | RegistryError::ServiceAlreadyPlaced { .. }
                    | RegistryError::UnknownInstance(_)),
                ) => {
                    debug!(task = %task.id, instance = %target, error = %e, attempt, "instance changed, re-planning");
                    last_contended = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_contended {
            Some(instance) => Err(PlacementError::RegistryContention {
                instance,
                attempts: self.backoff.max_attempts,
            }),
            None => Err(PlacementFailure {
                service: service.name.clone(),
                requirements: request.requirements,
                reason: FailureReason::InsufficientCapacity,
            }
            .into()),
        }
    }

    /// Place a PENDING task: reserve resources and bind it RUNNING.
    pub async fn place_task(
        &self,
        task: &TaskRecord,
        service: &ServiceSpec,
    ) -> Result<TaskRecord, PlacementError> {
        let reservation = self.reserve(task, service).await?;
        match self.registry.bind_task(&task.id, &reservation).await {
            Ok(placed) => {
                info!(
                    task = %placed.id,
                    service = %service.name,
                    instance = %reservation.instance_id,
                    host_port = ?reservation.host_port,
                    "task placed"
                );
                Ok(placed)
            }
            Err(e) => {
                self.registry.release(&reservation).await;
                Err(e.into())
            }
        }
    }
}
