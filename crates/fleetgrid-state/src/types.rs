//! Registry record types.
//!
//! These are the mutable runtime records for instances and tasks. Service
//! specs live in `fleetgrid-core`. All records serialize to JSON for the
//! snapshot store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use fleetgrid_core::{
    InstanceDescription, InstanceId, PlacementField, Resources, ServiceId, ServiceSpec, TaskId,
};

/// First port of the dynamic host-port range used by bridge networking.
pub const EPHEMERAL_PORT_START: u16 = 32768;

/// Last port (inclusive) of the dynamic host-port range.
pub const EPHEMERAL_PORT_END: u16 = 60999;

// ── Instance ──────────────────────────────────────────────────────

/// Membership of an instance in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    InService,
    Draining,
    Terminating,
}

/// A registered compute instance and its remaining capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub availability_zone: String,
    pub instance_type: String,
    pub attributes: HashMap<String, String>,
    pub total: Resources,
    pub available: Resources,
    pub status: InstanceStatus,
    pub protected_from_scale_in: bool,
    /// Unix timestamp (seconds) of launch.
    pub launched_at: u64,
    /// Host ports handed out to tasks on this instance.
    pub reserved_ports: BTreeSet<u16>,
    /// Reservations held here per service.
    #[serde(default)]
    pub service_tasks: BTreeMap<ServiceId, u32>,
}

impl InstanceRecord {
    /// A fresh in-service record with all capacity available.
    pub fn from_description(desc: &InstanceDescription) -> Self {
        Self {
            id: desc.id.clone(),
            availability_zone: desc.availability_zone.clone(),
            instance_type: desc.instance_type.clone(),
            attributes: desc.attributes.clone(),
            total: desc.resources,
            available: desc.resources,
            status: InstanceStatus::InService,
            protected_from_scale_in: desc.protected_from_scale_in,
            launched_at: desc.launched_at,
            reserved_ports: BTreeSet::new(),
            service_tasks: BTreeMap::new(),
        }
    }

    /// Resolve a placement field against this instance.
    pub fn attribute(&self, field: &PlacementField) -> Option<&str> {
        match field {
            PlacementField::AvailabilityZone => Some(&self.availability_zone),
            PlacementField::InstanceType => Some(&self.instance_type),
            PlacementField::InstanceId => Some(&self.id),
            PlacementField::Attribute(name) => self.attributes.get(name).map(String::as_str),
        }
    }

    pub fn is_schedulable(&self) -> bool {
        self.status == InstanceStatus::InService
    }

    /// Reservations held here for `service`.
    pub fn tasks_of(&self, service: &str) -> u32 {
        self.service_tasks.get(service).copied().unwrap_or(0)
    }

    /// Lowest unreserved port in the ephemeral range.
    pub fn next_free_port(&self) -> Option<u16> {
        (EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END).find(|p| !self.reserved_ports.contains(p))
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Stopping,
    Stopped,
}

/// Health as last reported by the health-check collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// One copy of a service's task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub service: ServiceId,
    /// `family:revision` the task was launched from.
    pub task_definition: String,
    pub revision: u32,
    pub requirements: Resources,
    /// Container port from the task definition; tasks with one need a host port.
    pub container_port: Option<u16>,
    /// Instance the task is placed on; `None` while unscheduled.
    pub instance_id: Option<InstanceId>,
    /// Dynamic host port, when the task exposes a container port.
    pub host_port: Option<u16>,
    pub state: TaskState,
    pub health: HealthStatus,
    /// Monotonic creation order across the registry.
    pub sequence: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TaskRecord {
    /// Not yet stopped.
    pub fn is_active(&self) -> bool {
        self.state != TaskState::Stopped
    }

    /// Occupies resources on an instance.
    pub fn is_placed(&self) -> bool {
        self.instance_id.is_some() && self.is_active()
    }

    pub fn is_healthy_running(&self) -> bool {
        self.state == TaskState::Running && self.health == HealthStatus::Healthy
    }
}

// ── Snapshot ──────────────────────────────────────────────────────

/// Point-in-time copy of the whole registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub instances: Vec<InstanceRecord>,
    pub tasks: Vec<TaskRecord>,
    pub services: Vec<ServiceSpec>,
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
