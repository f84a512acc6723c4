//! ServiceScheduler — reconciles each service's tasks toward its desired
//! count.
//!
//! Each pass over a service:
//! 1. Stops running tasks the health monitor marked unhealthy
//! 2. Stops excess tasks (pending, unhealthy, stale revision, then newest)
//! 3. Retries placement of pending tasks
//! 4. Launches new tasks from the current task definition
//!
//! A pass holds the service's pass claim from the registry, so a rollout
//! cannot start halfway through it. A launch that violates the service's
//! constraints stops further launches until the fleet, the task definition,
//! or the constraints change.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use fleetgrid_core::{
    InstanceId, PlacementConstraint, ServiceId, ServiceSpec, TargetRegistration, TaskDefinition,
};
use fleetgrid_placement::{PlacementEngine, PlacementError};
use fleetgrid_state::{ClusterRegistry, HealthStatus, StateStore, TaskRecord, TaskState};

use crate::error::{SchedulerError, SchedulerResult};

/// Result of trying to place one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceOutcome {
    /// The task is RUNNING on an instance.
    Placed(TaskRecord),
    /// No room (or the instance stayed contended); the task stays PENDING.
    Deferred(TaskRecord),
}

/// What one reconciliation pass over a service did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// New tasks created.
    pub launched: u32,
    /// Tasks placed (new or previously pending).
    pub placed: u32,
    /// Tasks left pending.
    pub deferred: u32,
    pub stopped: u32,
    /// Placement failures that will not be retried.
    pub failed: Vec<String>,
    /// A deployment owns the service right now.
    pub skipped: bool,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.launched == 0
            && self.placed == 0
            && self.deferred == 0
            && self.stopped == 0
            && self.failed.is_empty()
    }
}

/// Service shape and fleet under which a launch violated constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Unplaceable {
    definition: TaskDefinition,
    constraints: Vec<PlacementConstraint>,
    fleet: Vec<InstanceId>,
}

impl Unplaceable {
    fn new(service: &ServiceSpec, fleet: Vec<InstanceId>) -> Self {
        Self {
            definition: service.task_definition.clone(),
            constraints: service.placement_constraints.clone(),
            fleet,
        }
    }
}

/// Keeps services at their desired task counts.
pub struct ServiceScheduler {
    registry: ClusterRegistry,
    engine: PlacementEngine,
    targets: Arc<dyn TargetRegistration>,
    store: Option<StateStore>,
    unplaceable: Mutex<HashMap<ServiceId, Unplaceable>>,
}

impl ServiceScheduler {
    pub fn new(engine: PlacementEngine, targets: Arc<dyn TargetRegistration>) -> Self {
        Self {
            registry: engine.registry().clone(),
            engine,
            targets,
            store: None,
            unplaceable: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a registry snapshot after every pass of [`run`](Self::run).
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Create a PENDING task from `definition` and try to place it.
    pub async fn launch_task(
        &self,
        service: &ServiceSpec,
        definition: &TaskDefinition,
    ) -> SchedulerResult<PlaceOutcome> {
        let task = self.registry.create_task(&service.name, definition).await;
        self.try_place(&task, service).await
    }

    /// Place a PENDING task.
    ///
    /// A constraint violation stops the task and is returned as an error;
    /// insufficient capacity and contention leave it pending.
    pub async fn try_place(
        &self,
        task: &TaskRecord,
        service: &ServiceSpec,
    ) -> SchedulerResult<PlaceOutcome> {
        match self.engine.place_task(task, service).await {
            Ok(placed) => {
                self.register_target(&placed, service).await;
                Ok(PlaceOutcome::Placed(placed))
            }
            Err(PlacementError::Failed(failure)) if failure.is_retryable() => {
                debug!(task = %task.id, service = %service.name, "no capacity, task stays pending");
                Ok(PlaceOutcome::Deferred(task.clone()))
            }
            Err(PlacementError::Failed(failure)) => {
                warn!(task = %task.id, service = %service.name, error = %failure, "task cannot be placed");
                self.registry.finish_stop(&task.id).await?;
                Err(SchedulerError::ConstraintViolation(failure))
            }
            Err(PlacementError::RegistryContention { instance, attempts }) => {
                warn!(task = %task.id, %instance, attempts, "placement contended, task stays pending");
                Ok(PlaceOutcome::Deferred(task.clone()))
            }
            Err(PlacementError::Registry(e)) => Err(e.into()),
        }
    }

    /// Deregister, release, and stop a task. Stopping a stopped task is a
    /// no-op.
    pub async fn stop_task(&self, task_id: &str) -> SchedulerResult<TaskRecord> {
        let task = self
            .registry
            .task(task_id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if !task.is_active() {
            return Ok(task);
        }

        if task.is_placed() {
            self.registry.mark_stopping(task_id).await?;
            self.deregister_target(&task).await;
        }
        let stopped = self.registry.finish_stop(task_id).await?;
        info!(task = %task_id, service = %task.service, "task stopped");
        Ok(stopped)
    }

    async fn register_target(&self, task: &TaskRecord, service: &ServiceSpec) {
        if service.load_balancer.is_none() {
            return;
        }
        if let (Some(instance), Some(port)) = (&task.instance_id, task.host_port) {
            if let Err(e) = self.targets.register_target(instance, port).await {
                warn!(task = %task.id, %instance, port, error = %e, "target registration failed");
            }
        }
    }

    async fn deregister_target(&self, task: &TaskRecord) {
        let balanced = self
            .registry
            .service(&task.service)
            .await
            .is_some_and(|s| s.load_balancer.is_some());
        if !balanced {
            return;
        }
        if let (Some(instance), Some(port)) = (&task.instance_id, task.host_port) {
            if let Err(e) = self.targets.deregister_target(instance, port).await {
                warn!(task = %task.id, %instance, port, error = %e, "target deregistration failed");
            }
        }
    }

    /// Whether launches for `service` are on hold after a constraint
    /// violation under the same service shape and fleet.
    async fn launches_held(&self, service: &ServiceSpec) -> bool {
        let mut unplaceable = self.unplaceable.lock().await;
        let Some(held) = unplaceable.get(&service.name) else {
            return false;
        };
        let current = Unplaceable::new(service, self.registry.instance_ids().await);
        if *held == current {
            return true;
        }
        debug!(service = %service.name, "service or fleet changed, resuming launches");
        unplaceable.remove(&service.name);
        false
    }

    async fn hold_launches(&self, service: &ServiceSpec) {
        let held = Unplaceable::new(service, self.registry.instance_ids().await);
        self.unplaceable
            .lock()
            .await
            .insert(service.name.clone(), held);
    }

    /// One reconciliation pass over a single service.
    pub async fn reconcile_service(&self, name: &str) -> SchedulerResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let Some(_pass) = self.registry.claim_service_pass(name).await else {
            debug!(service = %name, "deployment in progress, skipping");
            summary.skipped = true;
            return Ok(summary);
        };
        let service = self
            .registry
            .service(name)
            .await
            .ok_or_else(|| SchedulerError::ServiceNotFound(name.to_string()))?;

        for task in self.registry.active_tasks_for_service(name).await {
            if task.state == TaskState::Running && task.health == HealthStatus::Unhealthy {
                info!(task = %task.id, service = %name, "replacing unhealthy task");
                self.stop_task(&task.id).await?;
                summary.stopped += 1;
            }
        }

        let desired = service.desired_count as usize;
        let mut active: Vec<TaskRecord> = self
            .registry
            .active_tasks_for_service(name)
            .await
            .into_iter()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Running))
            .collect();

        if active.len() > desired {
            let excess = active.len() - desired;
            active.sort_by_key(|t| (stop_rank(t, &service), Reverse(t.sequence)));
            for task in active.drain(..excess) {
                self.stop_task(&task.id).await?;
                summary.stopped += 1;
            }
        }

        for task in active.iter().filter(|t| t.state == TaskState::Pending) {
            let outcome = self.try_place(task, &service).await;
            record(&mut summary, outcome)?;
        }

        if active.len() < desired && self.launches_held(&service).await {
            debug!(
                service = %name,
                missing = desired - active.len(),
                "launches held after constraint violation"
            );
        } else {
            for _ in active.len()..desired {
                summary.launched += 1;
                let outcome = self.launch_task(&service, &service.task_definition).await;
                let violated = matches!(outcome, Err(SchedulerError::ConstraintViolation(_)));
                record(&mut summary, outcome)?;
                if violated {
                    self.hold_launches(&service).await;
                    break;
                }
            }
        }

        if !summary.is_noop() {
            info!(
                service = %name,
                desired,
                launched = summary.launched,
                placed = summary.placed,
                deferred = summary.deferred,
                stopped = summary.stopped,
                failed = summary.failed.len(),
                "service reconciled"
            );
        }
        Ok(summary)
    }

    /// Reconcile every service, logging (not propagating) per-service errors.
    pub async fn reconcile_all(&self) -> Vec<(ServiceId, ReconcileSummary)> {
        let mut results = Vec::new();
        for service in self.registry.services().await {
            match self.reconcile_service(&service.name).await {
                Ok(summary) => results.push((service.name, summary)),
                Err(e) => error!(service = %service.name, error = %e, "reconciliation failed"),
            }
        }
        results
    }

    /// Reconcile on every tick until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "service scheduler started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_all().await;
                    let purged = self.registry.purge_stopped_tasks().await;
                    if purged > 0 {
                        debug!(purged, "stopped tasks purged");
                    }
                    self.persist().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("service scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Save a registry snapshot to the attached store, if any.
    pub async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.registry.snapshot().await;
        if let Err(e) = store.save_snapshot(&snapshot) {
            error!(error = %e, "failed to persist registry snapshot");
        }
    }
}

/// Lower ranks are stopped first when trimming excess tasks.
fn stop_rank(task: &TaskRecord, service: &ServiceSpec) -> u8 {
    if task.state == TaskState::Pending {
        0
    } else if task.health == HealthStatus::Unhealthy {
        1
    } else if task.revision != service.task_definition.revision {
        2
    } else {
        3
    }
}

fn record(
    summary: &mut ReconcileSummary,
    outcome: SchedulerResult<PlaceOutcome>,
) -> SchedulerResult<()> {
    match outcome {
        Ok(PlaceOutcome::Placed(_)) => summary.placed += 1,
        Ok(PlaceOutcome::Deferred(_)) => summary.deferred += 1,
        Err(SchedulerError::ConstraintViolation(failure)) => summary.failed.push(failure.to_string()),
        Err(e) => return Err(e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use fleetgrid_core::{
        DeploymentPolicy, InstanceDescription, LoadBalancerBinding, Resources,
    };
    use fleetgrid_state::InstanceRecord;

    #[derive(Default)]
    pub(crate) struct RecordingTargets {
        pub registered: Mutex<Vec<(String, u16)>>,
    }

    #[async_trait]
    impl TargetRegistration for RecordingTargets {
        async fn register_target(&self, instance_id: &str, port: u16) -> anyhow::Result<()> {
            self.registered.lock().unwrap().push((instance_id.to_string(), port));
            Ok(())
        }

        async fn deregister_target(&self, instance_id: &str, port: u16) -> anyhow::Result<()> {
            self.registered
                .lock()
                .unwrap()
                .retain(|(i, p)| !(i == instance_id && *p == port));
            Ok(())
        }
    }

    fn service(desired: u32, memory: u32) -> ServiceSpec {
        ServiceSpec {
            name: "web".to_string(),
            task_definition: TaskDefinition {
                family: "web".to_string(),
                revision: 1,
                cpu: 256,
                memory,
                container_port: Some(80),
            },
            desired_count: desired,
            placement_strategies: vec![],
            placement_constraints: vec![],
            deployment: DeploymentPolicy::default(),
            scaling: None,
            load_balancer: Some(LoadBalancerBinding { container_port: 80 }),
        }
    }

    async fn add_instance(registry: &ClusterRegistry, id: &str, memory: u32) {
        registry
            .register_instance(InstanceRecord::from_description(&InstanceDescription {
                id: id.to_string(),
                availability_zone: "az-a".to_string(),
                instance_type: "m5.large".to_string(),
                resources: Resources::new(4096, memory),
                attributes: HashMap::new(),
                launched_at: 0,
                protected_from_scale_in: false,
            }))
            .await;
    }

    async fn setup(spec: ServiceSpec, memory: u32) -> (ServiceScheduler, Arc<RecordingTargets>) {
        let registry = ClusterRegistry::new();
        add_instance(&registry, "i-1", memory).await;
        registry.put_service(spec).await;
        let targets = Arc::new(RecordingTargets::default());
        let scheduler = ServiceScheduler::new(PlacementEngine::new(registry), targets.clone());
        (scheduler, targets)
    }

    #[tokio::test]
    async fn launches_up_to_desired_and_registers_targets() {
        let (scheduler, targets) = setup(service(3, 512), 4096).await;

        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!(summary.launched, 3);
        assert_eq!(summary.placed, 3);
        assert_eq!(targets.registered.lock().unwrap().len(), 3);

        // Converged: a second pass does nothing.
        assert!(scheduler.reconcile_service("web").await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn scale_down_stops_newest_and_deregisters() {
        let (scheduler, targets) = setup(service(3, 512), 4096).await;
        scheduler.reconcile_service("web").await.unwrap();
        let oldest = scheduler.registry().active_tasks_for_service("web").await[0].id.clone();

        scheduler.registry().set_desired_count("web", 1).await.unwrap();
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!(summary.stopped, 2);

        let remaining = scheduler.registry().active_tasks_for_service("web").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, oldest);
        assert_eq!(targets.registered.lock().unwrap().len(), 1);

        let inst = scheduler.registry().instance("i-1").await.unwrap();
        assert_eq!(inst.available.memory, 4096 - 512);
    }

    #[tokio::test]
    async fn pending_tasks_are_placed_when_capacity_appears() {
        let (scheduler, _) = setup(service(3, 1024), 2048).await;

        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!((summary.placed, summary.deferred), (2, 1));

        add_instance(scheduler.registry(), "i-2", 2048).await;
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!(summary.launched, 0);
        assert_eq!(summary.placed, 1);
        assert!(scheduler.registry().pending_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn excess_prefers_pending_tasks() {
        let (scheduler, _) = setup(service(3, 1024), 2048).await;
        scheduler.reconcile_service("web").await.unwrap();
        assert_eq!(scheduler.registry().pending_tasks().await.len(), 1);

        scheduler.registry().set_desired_count("web", 2).await.unwrap();
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!(summary.stopped, 1);
        assert!(scheduler.registry().pending_tasks().await.is_empty());
        assert_eq!(
            scheduler.registry().active_tasks_by_instance().await.get("i-1"),
            Some(&2)
        );
    }

    #[tokio::test]
    async fn unhealthy_tasks_are_replaced() {
        let (scheduler, _) = setup(service(2, 512), 4096).await;
        scheduler.reconcile_service("web").await.unwrap();
        let sick = scheduler.registry().active_tasks_for_service("web").await[0].id.clone();
        scheduler
            .registry()
            .set_task_health(&sick, HealthStatus::Unhealthy)
            .await
            .unwrap();

        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!((summary.stopped, summary.launched), (1, 1));
        let active = scheduler.registry().active_tasks_for_service("web").await;
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|t| t.id != sick));
    }

    #[tokio::test]
    async fn oversized_task_is_reported_and_stopped() {
        let (scheduler, _) = setup(service(1, 8192), 4096).await;
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert!(scheduler.registry().active_tasks_for_service("web").await.is_empty());
    }

    #[tokio::test]
    async fn unplaceable_service_waits_for_fleet_change() {
        let (scheduler, _) = setup(service(3, 8192), 4096).await;
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!((summary.launched, summary.failed.len()), (1, 1));

        // Nothing changed: no new task records churn through.
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert!(summary.is_noop());
        assert_eq!(scheduler.registry().tasks().await.len(), 1);

        add_instance(scheduler.registry(), "i-2", 32768).await;
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!((summary.launched, summary.placed), (3, 3));
    }

    #[tokio::test]
    async fn unplaceable_service_resumes_on_new_definition() {
        let (scheduler, _) = setup(service(2, 8192), 4096).await;
        scheduler.reconcile_service("web").await.unwrap();
        assert!(scheduler.reconcile_service("web").await.unwrap().is_noop());

        let mut definition = service(2, 1024).task_definition;
        definition.revision = 2;
        scheduler
            .registry()
            .set_task_definition("web", definition)
            .await
            .unwrap();
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert_eq!((summary.launched, summary.placed), (2, 2));
    }

    /// Holds every target registration until released.
    #[derive(Default)]
    struct GatedTargets {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TargetRegistration for GatedTargets {
        async fn register_target(&self, _instance_id: &str, _port: u16) -> anyhow::Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn deregister_target(&self, _instance_id: &str, _port: u16) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn deployment_waits_for_running_pass() {
        let registry = ClusterRegistry::new();
        add_instance(&registry, "i-1", 4096).await;
        registry.put_service(service(1, 512)).await;
        let targets = Arc::new(GatedTargets::default());
        let scheduler = Arc::new(ServiceScheduler::new(
            PlacementEngine::new(registry.clone()),
            targets.clone(),
        ));

        let pass = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.reconcile_service("web").await }
        });
        targets.entered.notified().await;

        let begin = tokio::spawn({
            let registry = registry.clone();
            async move { registry.begin_deployment("web").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!begin.is_finished());

        targets.release.notify_one();
        assert_eq!(pass.await.unwrap().unwrap().placed, 1);
        assert!(begin.await.unwrap());
        assert!(scheduler.reconcile_service("web").await.unwrap().skipped);
    }

    #[tokio::test]
    async fn skips_service_under_deployment() {
        let (scheduler, _) = setup(service(2, 512), 4096).await;
        scheduler.registry().begin_deployment("web").await;
        let summary = scheduler.reconcile_service("web").await.unwrap();
        assert!(summary.skipped);
        assert!(scheduler.registry().active_tasks_for_service("web").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_service_is_an_error() {
        let (scheduler, _) = setup(service(1, 512), 4096).await;
        assert!(matches!(
            scheduler.reconcile_service("nope").await,
            Err(SchedulerError::ServiceNotFound(_))
        ));
    }
}
