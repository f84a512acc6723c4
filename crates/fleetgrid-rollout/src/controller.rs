//! Deployment controller — drives one rolling deployment per service.
//!
//! A deployment moves through `Planning → Replacing { batch } → Steady`, or
//! ends `Failed` or `Aborted`. While it runs, the service is marked in the
//! registry so the service scheduler leaves its task set alone.

use std::cmp::Reverse;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use fleetgrid_core::{HealthCheck, InstanceId, ServiceId, ServiceSpec, TaskDefinition, TaskId};
use fleetgrid_health::unhealthy_tasks;
use fleetgrid_scheduler::{PlaceOutcome, SchedulerError, ServiceScheduler};
use fleetgrid_state::{ClusterRegistry, TaskRecord, TaskState};

use crate::error::{DeploymentFailure, DeploymentProgress};
use crate::planner::{self, TaskCounts};

const EVENT_BUFFER: usize = 256;

/// Current phase of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum DeploymentPhase {
    Planning,
    Replacing { batch: u32 },
    /// Every task runs the new definition and passes its health check.
    Steady,
    Failed { reason: DeploymentFailure },
    Aborted,
}

impl DeploymentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Steady | Self::Failed { .. } | Self::Aborted)
    }
}

/// Progress events, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeploymentEvent {
    Started {
        service: ServiceId,
        from: String,
        to: String,
        desired: u32,
    },
    BatchStarted {
        batch: u32,
        stopping: u32,
        starting: u32,
    },
    TaskStopped {
        task: TaskId,
    },
    TaskPlaced {
        task: TaskId,
        instance: InstanceId,
        host_port: Option<u16>,
    },
    /// No capacity yet; the task stays pending and is retried while the
    /// batch waits.
    PlacementDeferred {
        task: TaskId,
    },
    BatchHealthy {
        batch: u32,
    },
    Completed {
        service: ServiceId,
        batches: u32,
    },
    Failed {
        reason: DeploymentFailure,
    },
    Aborted {
        batches: u32,
    },
}

/// Control over a running deployment.
pub struct DeploymentHandle {
    abort: watch::Sender<bool>,
    phase: watch::Receiver<DeploymentPhase>,
    join: JoinHandle<DeploymentPhase>,
}

impl DeploymentHandle {
    /// Stop issuing batches. Tasks already placed keep their state.
    pub fn abort(&self) {
        let _ = self.abort.send(true);
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.phase.borrow().clone()
    }

    /// Wait for the deployment to reach a terminal phase.
    pub async fn wait(self) -> Result<DeploymentPhase, tokio::task::JoinError> {
        self.join.await
    }
}

/// Starts rolling deployments.
#[derive(Clone)]
pub struct DeploymentController {
    scheduler: Arc<ServiceScheduler>,
    health: Arc<dyn HealthCheck>,
}

impl DeploymentController {
    pub fn new(scheduler: Arc<ServiceScheduler>, health: Arc<dyn HealthCheck>) -> Self {
        Self { scheduler, health }
    }

    /// Spawn a deployment of `definition` to `service`.
    ///
    /// Returns a handle for abort and completion, and the stream of progress
    /// events. Dropping the stream does not stop the deployment.
    pub fn roll_out(
        &self,
        service: &str,
        definition: TaskDefinition,
    ) -> (DeploymentHandle, ReceiverStream<DeploymentEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (abort_tx, abort_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(DeploymentPhase::Planning);

        let deployment = Deployment {
            service: service.to_string(),
            definition,
            registry: self.scheduler.registry().clone(),
            scheduler: self.scheduler.clone(),
            health: self.health.clone(),
            events: events_tx,
            phase: phase_tx,
            abort: abort_rx,
            abort_closed: false,
            batches: 0,
        };
        let join = tokio::spawn(deployment.run());

        let handle = DeploymentHandle {
            abort: abort_tx,
            phase: phase_rx,
            join,
        };
        (handle, ReceiverStream::new(events_rx))
    }
}

/// Why a batch wait ended early.
enum Interrupted {
    Aborted,
    Failed(DeploymentFailure),
}

impl From<DeploymentFailure> for Interrupted {
    fn from(failure: DeploymentFailure) -> Self {
        Self::Failed(failure)
    }
}

impl From<SchedulerError> for Interrupted {
    fn from(e: SchedulerError) -> Self {
        Self::Failed(scheduler_failure(e))
    }
}

fn scheduler_failure(e: SchedulerError) -> DeploymentFailure {
    match e {
        SchedulerError::ConstraintViolation(failure) => DeploymentFailure::ConstraintViolation {
            message: failure.to_string(),
        },
        SchedulerError::ServiceNotFound(service) => DeploymentFailure::UnknownService { service },
        other => DeploymentFailure::Scheduler {
            message: other.to_string(),
        },
    }
}

/// Old and new tasks of the service, with health resolved.
struct TaskSet {
    old: Vec<(TaskRecord, bool)>,
    new: Vec<(TaskRecord, bool)>,
}

impl TaskSet {
    fn counts(&self) -> TaskCounts {
        let healthy = |tasks: &[(TaskRecord, bool)]| tasks.iter().filter(|(_, h)| *h).count() as u32;
        TaskCounts {
            old_active: self.old.len() as u32,
            new_active: self.new.len() as u32,
            healthy_running: healthy(&self.old) + healthy(&self.new),
            new_healthy: healthy(&self.new),
        }
    }

    fn progress(&self, batches: u32) -> DeploymentProgress {
        let counts = self.counts();
        DeploymentProgress {
            batches,
            new_running: self
                .new
                .iter()
                .filter(|(t, _)| t.state == TaskState::Running)
                .count() as u32,
            new_healthy: counts.new_healthy,
            old_active: counts.old_active,
        }
    }
}

struct Deployment {
    service: ServiceId,
    definition: TaskDefinition,
    registry: ClusterRegistry,
    scheduler: Arc<ServiceScheduler>,
    health: Arc<dyn HealthCheck>,
    events: mpsc::Sender<DeploymentEvent>,
    phase: watch::Sender<DeploymentPhase>,
    abort: watch::Receiver<bool>,
    abort_closed: bool,
    batches: u32,
}

impl Deployment {
    async fn run(mut self) -> DeploymentPhase {
        if !self.registry.begin_deployment(&self.service).await {
            let reason = DeploymentFailure::AlreadyInProgress {
                service: self.service.clone(),
            };
            return self.finish(Err(Interrupted::Failed(reason)));
        }

        let result = self.drive().await;
        self.registry.end_deployment(&self.service).await;
        self.finish(result)
    }

    fn finish(&mut self, result: Result<(), Interrupted>) -> DeploymentPhase {
        let phase = match result {
            Ok(()) => {
                info!(service = %self.service, batches = self.batches, "deployment completed");
                self.emit(DeploymentEvent::Completed {
                    service: self.service.clone(),
                    batches: self.batches,
                });
                DeploymentPhase::Steady
            }
            Err(Interrupted::Aborted) => {
                info!(service = %self.service, batches = self.batches, "deployment aborted");
                self.emit(DeploymentEvent::Aborted {
                    batches: self.batches,
                });
                DeploymentPhase::Aborted
            }
            Err(Interrupted::Failed(reason)) => {
                warn!(service = %self.service, error = %reason, "deployment failed");
                self.emit(DeploymentEvent::Failed {
                    reason: reason.clone(),
                });
                DeploymentPhase::Failed { reason }
            }
        };
        self.set_phase(phase.clone());
        phase
    }

    async fn drive(&mut self) -> Result<(), Interrupted> {
        let service = self.current_service().await?;
        planner::validate(service.desired_count, &service.deployment)?;

        info!(
            service = %self.service,
            from = %service.task_definition.reference(),
            to = %self.definition.reference(),
            desired = service.desired_count,
            "deployment started"
        );
        self.emit(DeploymentEvent::Started {
            service: self.service.clone(),
            from: service.task_definition.reference(),
            to: self.definition.reference(),
            desired: service.desired_count,
        });

        // Set while no batch could be planned; bounded by the health timeout.
        let mut stalled_since: Option<Instant> = None;

        loop {
            self.check_abort()?;

            // Desired may change under us (service scaler).
            let service = self.current_service().await?;
            let desired = service.desired_count;
            let bounds = planner::validate(desired, &service.deployment)?;
            let target = self.target_spec(&service);

            let mut tasks = self.task_set().await;
            self.trim_new(&mut tasks, desired).await?;
            let counts = tasks.counts();

            if counts.is_complete(desired) {
                self.registry
                    .set_task_definition(&self.service, self.definition.clone())
                    .await
                    .map_err(SchedulerError::from)?;
                return Ok(());
            }

            let plan = planner::plan_batch(desired, bounds, &counts);
            if plan.is_empty() {
                let waiting: Vec<TaskId> = tasks
                    .old
                    .iter()
                    .chain(tasks.new.iter())
                    .filter(|(_, healthy)| !healthy)
                    .map(|(t, _)| t.id.clone())
                    .collect();
                if waiting.is_empty() {
                    return Err(DeploymentFailure::InvalidPolicy {
                        desired,
                        minimum_healthy_percent: service.deployment.minimum_healthy_percent,
                        maximum_percent: service.deployment.maximum_percent,
                    }
                    .into());
                }
                let since = *stalled_since.get_or_insert_with(Instant::now);
                debug!(service = %self.service, waiting = waiting.len(), "no batch possible, waiting on health");
                self.await_health(&waiting, &target, since + service.deployment.health_check_timeout)
                    .await?;
                continue;
            }
            stalled_since = None;

            self.batches += 1;
            let batch = self.batches;
            self.set_phase(DeploymentPhase::Replacing { batch });
            info!(
                service = %self.service,
                batch,
                stopping = plan.stop,
                starting = plan.start,
                "batch started"
            );
            self.emit(DeploymentEvent::BatchStarted {
                batch,
                stopping: plan.stop,
                starting: plan.start,
            });

            // Unhealthy old tasks go first, then the newest.
            let mut old = tasks.old.clone();
            old.sort_by_key(|(t, healthy)| (*healthy, Reverse(t.sequence)));
            for (task, _) in old.into_iter().take(plan.stop as usize) {
                self.scheduler.stop_task(&task.id).await?;
                self.emit(DeploymentEvent::TaskStopped { task: task.id });
            }

            for _ in 0..plan.start {
                match self.scheduler.launch_task(&target, &self.definition).await? {
                    PlaceOutcome::Placed(task) => self.emit_placed(&task),
                    PlaceOutcome::Deferred(task) => {
                        self.emit(DeploymentEvent::PlacementDeferred { task: task.id });
                    }
                }
            }

            // Wait on every new task that is not yet healthy, including
            // ones left over from earlier batches.
            let tasks = self.task_set().await;
            let waiting: Vec<TaskId> = tasks
                .new
                .iter()
                .filter(|(_, healthy)| !healthy)
                .map(|(t, _)| t.id.clone())
                .collect();
            let deadline = Instant::now() + service.deployment.health_check_timeout;
            self.await_health(&waiting, &target, deadline).await?;

            debug!(service = %self.service, batch, "batch healthy");
            self.emit(DeploymentEvent::BatchHealthy { batch });
        }
    }

    /// Poll until every task in `waiting` is healthy, retrying placement of
    /// pending ones. Tasks that stop meanwhile are dropped from the wait;
    /// the next batch replaces them.
    async fn await_health(
        &mut self,
        waiting: &[TaskId],
        target: &ServiceSpec,
        deadline: Instant,
    ) -> Result<(), Interrupted> {
        let interval = target.deployment.health_check_interval;
        let mut waiting = waiting.to_vec();

        loop {
            self.check_abort()?;

            let mut running = Vec::new();
            let mut pending = Vec::new();
            for id in &waiting {
                match self.registry.task(id).await {
                    Some(t) if t.state == TaskState::Running => running.push(id.clone()),
                    Some(t) if t.state == TaskState::Pending => pending.push(t),
                    _ => debug!(task = %id, "task left the wait"),
                }
            }

            for task in &pending {
                if let PlaceOutcome::Placed(placed) = self.scheduler.try_place(task, target).await? {
                    self.emit_placed(&placed);
                }
            }

            waiting = unhealthy_tasks(self.health.as_ref(), &running).await;
            waiting.extend(pending.iter().map(|t| t.id.clone()));
            if waiting.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                let tasks = self.task_set().await;
                return Err(self.timeout(waiting, &tasks).into());
            }

            let pause = interval.min(deadline - now);
            if self.abort_closed {
                tokio::time::sleep(pause).await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = self.abort.changed() => {
                    // Handle dropped: nobody can abort any more.
                    if changed.is_err() {
                        self.abort_closed = true;
                    }
                }
            }
        }
    }

    fn timeout(&self, mut unhealthy: Vec<TaskId>, tasks: &TaskSet) -> DeploymentFailure {
        unhealthy.sort();
        DeploymentFailure::HealthCheckTimeout {
            unhealthy,
            progress: tasks.progress(self.batches),
        }
    }

    /// Stop new tasks beyond `desired` (the service scaled in mid-rollout).
    async fn trim_new(&mut self, tasks: &mut TaskSet, desired: u32) -> Result<(), Interrupted> {
        let excess = tasks.new.len().saturating_sub(desired as usize);
        if excess == 0 {
            return Ok(());
        }
        tasks
            .new
            .sort_by_key(|(t, healthy)| (t.state == TaskState::Running, *healthy, Reverse(t.sequence)));
        for (task, _) in tasks.new.drain(..excess) {
            self.scheduler.stop_task(&task.id).await?;
            self.emit(DeploymentEvent::TaskStopped { task: task.id });
        }
        Ok(())
    }

    async fn task_set(&self) -> TaskSet {
        let reference = self.definition.reference();
        let mut set = TaskSet {
            old: Vec::new(),
            new: Vec::new(),
        };
        for task in self.registry.active_tasks_for_service(&self.service).await {
            if !matches!(task.state, TaskState::Pending | TaskState::Running) {
                continue;
            }
            let healthy = task.state == TaskState::Running && self.health.is_healthy(&task.id).await;
            if task.task_definition == reference {
                set.new.push((task, healthy));
            } else {
                set.old.push((task, healthy));
            }
        }
        set
    }

    async fn current_service(&self) -> Result<ServiceSpec, Interrupted> {
        self.registry.service(&self.service).await.ok_or_else(|| {
            Interrupted::Failed(DeploymentFailure::UnknownService {
                service: self.service.clone(),
            })
        })
    }

    /// The service as new tasks should be placed: its placement rules with
    /// the new task definition.
    fn target_spec(&self, service: &ServiceSpec) -> ServiceSpec {
        ServiceSpec {
            task_definition: self.definition.clone(),
            ..service.clone()
        }
    }

    fn check_abort(&self) -> Result<(), Interrupted> {
        if *self.abort.borrow() {
            Err(Interrupted::Aborted)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: DeploymentPhase) {
        self.phase.send_replace(phase);
    }

    fn emit_placed(&self, task: &TaskRecord) {
        if let Some(instance) = &task.instance_id {
            self.emit(DeploymentEvent::TaskPlaced {
                task: task.id.clone(),
                instance: instance.clone(),
                host_port: task.host_port,
            });
        }
    }

    /// Never waits on the subscriber. Events past the buffer are dropped.
    fn emit(&self, event: DeploymentEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                debug!(service = %self.service, ?event, "event stream full, dropping event");
            }
        }
    }
}
