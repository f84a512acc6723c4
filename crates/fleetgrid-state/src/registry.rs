//! ClusterRegistry — the in-memory source of truth shared by every control
//! loop.
//!
//! Each instance record sits behind its own `Mutex`, so placing tasks on
//! different instances never serializes, while every change to one
//! instance's available resources goes through a single critical section.
//! The instance map itself is only write-locked to register or remove
//! instances.
//!
//! Reservation uses `try_lock`: a busy instance surfaces as
//! [`RegistryError::Contended`] and callers retry with backoff rather than
//! queueing behind the writer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use fleetgrid_core::{
    InstanceId, Resources, ServiceId, ServiceSpec, TaskDefinition, TaskId,
};

use crate::error::RegistryError;
use crate::types::*;

type InstanceSlot = Arc<Mutex<InstanceRecord>>;

/// Resources (and optionally a host port) held on one instance for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub instance_id: InstanceId,
    pub service: ServiceId,
    pub resources: Resources,
    pub host_port: Option<u16>,
}

/// What one task of `service` asks an instance for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub service: ServiceId,
    pub resources: Resources,
    pub host_port: bool,
    /// Refuse instances already holding a reservation for `service`.
    pub exclusive: bool,
}

impl ReservationRequest {
    pub fn new(service: impl Into<ServiceId>, resources: Resources) -> Self {
        Self {
            service: service.into(),
            resources,
            host_port: false,
            exclusive: false,
        }
    }

    pub fn with_host_port(mut self) -> Self {
        self.host_port = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Request matching a task's requirements, with a host port when the
    /// task exposes a container port.
    pub fn for_task(task: &TaskRecord) -> Self {
        Self {
            service: task.service.clone(),
            resources: task.requirements,
            host_port: task.container_port.is_some(),
            exclusive: false,
        }
    }
}

/// Exclusive claim on one service's reconcile pass. Rollouts cannot start
/// while it is held.
pub struct ServicePass {
    service: ServiceId,
    _guard: OwnedMutexGuard<()>,
}

impl ServicePass {
    pub fn service(&self) -> &str {
        &self.service
    }
}

#[derive(Default)]
struct Inner {
    instances: RwLock<BTreeMap<InstanceId, InstanceSlot>>,
    tasks: RwLock<BTreeMap<TaskId, TaskRecord>>,
    services: RwLock<BTreeMap<ServiceId, ServiceSpec>>,
    /// Services with a rollout in progress.
    deployments: Mutex<BTreeSet<ServiceId>>,
    /// Serializes reconcile passes against rollout start, per service.
    service_gates: Mutex<HashMap<ServiceId, Arc<Mutex<()>>>>,
    next_sequence: AtomicU64,
}

/// Shared registry of instances, tasks, and services. Cheap to clone.
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    inner: Arc<Inner>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Register an instance. Returns false (and leaves the existing record
    /// untouched) if the id is already known.
    pub async fn register_instance(&self, record: InstanceRecord) -> bool {
        let mut instances = self.inner.instances.write().await;
        if instances.contains_key(&record.id) {
            return false;
        }
        info!(
            instance = %record.id,
            zone = %record.availability_zone,
            capacity = %record.total,
            "instance registered"
        );
        instances.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        true
    }

    /// Deregister an instance. Tasks still placed on it are marked stopped
    /// and returned so callers can replace them and drop their targets.
    pub async fn remove_instance(
        &self,
        instance_id: &str,
    ) -> Option<(InstanceRecord, Vec<TaskRecord>)> {
        let slot = self.inner.instances.write().await.remove(instance_id)?;
        let record = slot.lock().await.clone();

        let now = epoch_secs();
        let mut orphaned = Vec::new();
        let mut tasks = self.inner.tasks.write().await;
        for task in tasks.values_mut() {
            if task.is_placed() && task.instance_id.as_deref() == Some(instance_id) {
                task.state = TaskState::Stopped;
                task.updated_at = now;
                orphaned.push(task.clone());
            }
        }

        if orphaned.is_empty() {
            info!(instance = %instance_id, "instance removed");
        } else {
            warn!(
                instance = %instance_id,
                tasks = orphaned.len(),
                "instance removed with tasks still placed"
            );
        }
        Some((record, orphaned))
    }

    pub async fn instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        let slot = self.slot(instance_id).await.ok()?;
        let record = slot.lock().await.clone();
        Some(record)
    }

    /// Snapshot of every registered instance, ordered by id.
    pub async fn instances(&self) -> Vec<InstanceRecord> {
        let slots: Vec<InstanceSlot> = self.inner.instances.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.lock().await.clone());
        }
        records
    }

    pub async fn instance_ids(&self) -> Vec<InstanceId> {
        self.inner.instances.read().await.keys().cloned().collect()
    }

    pub async fn set_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), RegistryError> {
        let slot = self.slot(instance_id).await?;
        let mut record = slot.lock().await;
        if record.status != status {
            debug!(instance = %instance_id, from = ?record.status, to = ?status, "instance status changed");
            record.status = status;
        }
        Ok(())
    }

    pub async fn set_protection(&self, instance_id: &str, protected: bool) -> Result<(), RegistryError> {
        let slot = self.slot(instance_id).await?;
        slot.lock().await.protected_from_scale_in = protected;
        Ok(())
    }

    /// Reserve what `request` asks for on one instance.
    ///
    /// This is the only place available resources decrease. It fails fast
    /// with [`RegistryError::Contended`] if another writer holds the
    /// instance. Exclusive requests are checked against the instance's
    /// per-service count inside the same critical section.
    pub async fn try_reserve(
        &self,
        instance_id: &str,
        request: &ReservationRequest,
    ) -> Result<Reservation, RegistryError> {
        let requested = request.resources;
        let slot = self.slot(instance_id).await?;
        let mut record = slot
            .try_lock()
            .map_err(|_| RegistryError::Contended(instance_id.to_string()))?;

        if !record.is_schedulable() {
            return Err(RegistryError::NotSchedulable {
                instance: instance_id.to_string(),
                status: record.status,
            });
        }

        if request.exclusive && record.tasks_of(&request.service) > 0 {
            return Err(RegistryError::ServiceAlreadyPlaced {
                instance: instance_id.to_string(),
                service: request.service.clone(),
            });
        }

        let remaining = record.available.checked_sub(&requested).ok_or_else(|| {
            RegistryError::InsufficientResources {
                instance: instance_id.to_string(),
                requested,
                available: record.available,
            }
        })?;

        let host_port = if request.host_port {
            Some(
                record
                    .next_free_port()
                    .ok_or_else(|| RegistryError::NoFreePort(instance_id.to_string()))?,
            )
        } else {
            None
        };

        record.available = remaining;
        if let Some(port) = host_port {
            record.reserved_ports.insert(port);
        }
        *record
            .service_tasks
            .entry(request.service.clone())
            .or_insert(0) += 1;
        debug!(
            instance = %instance_id,
            service = %request.service,
            reserved = %requested,
            remaining = %remaining,
            ?host_port,
            "resources reserved"
        );

        Ok(Reservation {
            instance_id: instance_id.to_string(),
            service: request.service.clone(),
            resources: requested,
            host_port,
        })
    }

    /// Return a reservation to its instance. Returns false if the instance
    /// is already gone.
    pub async fn release(&self, reservation: &Reservation) -> bool {
        let Ok(slot) = self.slot(&reservation.instance_id).await else {
            return false;
        };
        let mut record = slot.lock().await;
        record.available = record
            .available
            .saturating_add(&reservation.resources)
            .min(&record.total);
        if let Some(port) = reservation.host_port {
            record.reserved_ports.remove(&port);
        }
        if let Some(count) = record.service_tasks.get_mut(&reservation.service) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                record.service_tasks.remove(&reservation.service);
            }
        }
        debug!(
            instance = %reservation.instance_id,
            released = %reservation.resources,
            available = %record.available,
            "resources released"
        );
        true
    }

    async fn slot(&self, instance_id: &str) -> Result<InstanceSlot, RegistryError> {
        self.inner
            .instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownInstance(instance_id.to_string()))
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Create a PENDING, unplaced task for `service` from `definition`.
    pub async fn create_task(&self, service: &str, definition: &TaskDefinition) -> TaskRecord {
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let now = epoch_secs();
        let task = TaskRecord {
            id: format!("{service}-{sequence:06}"),
            service: service.to_string(),
            task_definition: definition.reference(),
            revision: definition.revision,
            requirements: definition.requirements(),
            container_port: definition.container_port,
            instance_id: None,
            host_port: None,
            state: TaskState::Pending,
            health: HealthStatus::Unknown,
            sequence,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        debug!(task = %task.id, %service, definition = %task.task_definition, "task created");
        task
    }

    pub async fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.tasks.read().await.get(task_id).cloned()
    }

    /// Every task, ordered by id.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.inner.tasks.read().await.values().cloned().collect()
    }

    /// Non-stopped tasks of one service, oldest first.
    pub async fn active_tasks_for_service(&self, service: &str) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.service == service && t.is_active())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Unplaced tasks across all services, oldest first.
    pub async fn pending_tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Number of placed tasks of `service` per instance.
    pub async fn placed_counts_for_service(&self, service: &str) -> HashMap<InstanceId, u32> {
        let mut counts = HashMap::new();
        for task in self.inner.tasks.read().await.values() {
            if task.service == service && task.is_placed() {
                if let Some(instance) = &task.instance_id {
                    *counts.entry(instance.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Number of placed tasks (any service) per instance.
    pub async fn active_tasks_by_instance(&self) -> HashMap<InstanceId, u32> {
        let mut counts = HashMap::new();
        for task in self.inner.tasks.read().await.values() {
            if let (true, Some(instance)) = (task.is_placed(), &task.instance_id) {
                *counts.entry(instance.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Bind a PENDING task to a reservation and mark it RUNNING.
    pub async fn bind_task(
        &self,
        task_id: &str,
        reservation: &Reservation,
    ) -> Result<TaskRecord, RegistryError> {
        self.update_task(task_id, |task| {
            task.instance_id = Some(reservation.instance_id.clone());
            task.host_port = reservation.host_port;
            task.state = TaskState::Running;
            task.health = HealthStatus::Unknown;
        })
        .await
    }

    pub async fn set_task_health(
        &self,
        task_id: &str,
        health: HealthStatus,
    ) -> Result<TaskRecord, RegistryError> {
        self.update_task(task_id, |task| task.health = health).await
    }

    pub async fn mark_stopping(&self, task_id: &str) -> Result<TaskRecord, RegistryError> {
        self.update_task(task_id, |task| {
            if task.is_active() {
                task.state = TaskState::Stopping;
            }
        })
        .await
    }

    /// Mark a task STOPPED and hand its resources back to the instance.
    pub async fn finish_stop(&self, task_id: &str) -> Result<TaskRecord, RegistryError> {
        let before = self
            .task(task_id)
            .await
            .ok_or_else(|| RegistryError::UnknownTask(task_id.to_string()))?;

        if before.is_placed() {
            if let Some(instance_id) = &before.instance_id {
                self.release(&Reservation {
                    instance_id: instance_id.clone(),
                    service: before.service.clone(),
                    resources: before.requirements,
                    host_port: before.host_port,
                })
                .await;
            }
        }

        self.update_task(task_id, |task| task.state = TaskState::Stopped)
            .await
    }

    /// Apply `f` to a task record under the task map's write lock.
    pub async fn update_task<F>(&self, task_id: &str, f: F) -> Result<TaskRecord, RegistryError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut tasks = self.inner.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::UnknownTask(task_id.to_string()))?;
        f(task);
        task.updated_at = epoch_secs();
        Ok(task.clone())
    }

    /// Drop stopped task records. Returns how many were removed.
    pub async fn purge_stopped_tasks(&self) -> usize {
        let mut tasks = self.inner.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| t.is_active());
        before - tasks.len()
    }

    // ── Services ───────────────────────────────────────────────────

    pub async fn put_service(&self, spec: ServiceSpec) {
        debug!(service = %spec.name, desired = spec.desired_count, "service stored");
        self.inner
            .services
            .write()
            .await
            .insert(spec.name.clone(), spec);
    }

    pub async fn service(&self, name: &str) -> Option<ServiceSpec> {
        self.inner.services.read().await.get(name).cloned()
    }

    pub async fn services(&self) -> Vec<ServiceSpec> {
        self.inner.services.read().await.values().cloned().collect()
    }

    /// Set a service's desired count, returning the previous value.
    pub async fn set_desired_count(&self, name: &str, desired: u32) -> Result<u32, RegistryError> {
        let mut services = self.inner.services.write().await;
        let spec = services
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;
        let previous = spec.desired_count;
        spec.desired_count = desired;
        Ok(previous)
    }

    pub async fn set_task_definition(
        &self,
        name: &str,
        definition: TaskDefinition,
    ) -> Result<(), RegistryError> {
        let mut services = self.inner.services.write().await;
        let spec = services
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;
        spec.task_definition = definition;
        Ok(())
    }

    async fn service_gate(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .service_gates
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Claim the reconcile pass for `name`. Returns `None` while a rollout
    /// owns the service; otherwise waits out any pass already running.
    pub async fn claim_service_pass(&self, name: &str) -> Option<ServicePass> {
        let guard = self.service_gate(name).await.lock_owned().await;
        if self.deployment_in_progress(name).await {
            return None;
        }
        Some(ServicePass {
            service: name.to_string(),
            _guard: guard,
        })
    }

    /// Mark a rollout in progress. Returns false if one already is. Waits
    /// for an in-flight reconcile pass of the same service to finish.
    pub async fn begin_deployment(&self, name: &str) -> bool {
        let _gate = self.service_gate(name).await.lock_owned().await;
        self.inner.deployments.lock().await.insert(name.to_string())
    }

    pub async fn end_deployment(&self, name: &str) {
        self.inner.deployments.lock().await.remove(name);
    }

    pub async fn deployment_in_progress(&self, name: &str) -> bool {
        self.inner.deployments.lock().await.contains(name)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            instances: self.instances().await,
            tasks: self.tasks().await,
            services: self.services().await,
        }
    }

    /// Replace the registry contents with `snapshot`.
    pub async fn restore(&self, snapshot: RegistrySnapshot) {
        let next_sequence = snapshot
            .tasks
            .iter()
            .map(|t| t.sequence + 1)
            .max()
            .unwrap_or(0);

        let mut instances = self.inner.instances.write().await;
        let mut tasks = self.inner.tasks.write().await;
        let mut services = self.inner.services.write().await;

        let mut held: HashMap<InstanceId, BTreeMap<ServiceId, u32>> = HashMap::new();
        for task in snapshot.tasks.iter().filter(|t| t.is_placed()) {
            if let Some(instance) = &task.instance_id {
                *held
                    .entry(instance.clone())
                    .or_default()
                    .entry(task.service.clone())
                    .or_insert(0) += 1;
            }
        }

        *instances = snapshot
            .instances
            .into_iter()
            .map(|mut r| {
                r.service_tasks = held.remove(&r.id).unwrap_or_default();
                (r.id.clone(), Arc::new(Mutex::new(r)))
            })
            .collect();
        *tasks = snapshot
            .tasks
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        *services = snapshot
            .services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        self.inner
            .next_sequence
            .fetch_max(next_sequence, Ordering::Relaxed);

        info!(
            instances = instances.len(),
            tasks = tasks.len(),
            services = services.len(),
            "registry restored from snapshot"
        );
    }
}
