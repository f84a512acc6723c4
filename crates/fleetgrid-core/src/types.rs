//! Shared domain types: resource vectors, placement rules, service and
//! capacity provider specs.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;

/// Identifier of a registered compute instance.
pub type InstanceId = String;

/// Identifier of a task.
pub type TaskId = String;

/// Identifier (name) of a service.
pub type ServiceId = String;

// ── Resources ─────────────────────────────────────────────────────

/// A CPU/memory resource vector.
///
/// CPU is in CPU units (1024 per vCPU), memory in MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    pub memory: u32,
}

impl Resources {
    pub const ZERO: Resources = Resources { cpu: 0, memory: 0 };

    pub fn new(cpu: u32, memory: u32) -> Self {
        Self { cpu, memory }
    }

    /// Whether `self` fits inside `available` on every dimension.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu <= available.cpu && self.memory <= available.memory
    }

    /// Subtract `other`, or `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_sub(other.cpu)?,
            memory: self.memory.checked_sub(other.memory)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
        }
    }

    /// Component-wise minimum.
    pub fn min(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.min(other.cpu),
            memory: self.memory.min(other.memory),
        }
    }

    pub fn get(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} memory={}MiB", self.cpu, self.memory)
    }
}

/// A single resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

// ── Placement rules ───────────────────────────────────────────────

/// An instance field that placement rules can group or filter on.
///
/// Serialized as a string: `availability-zone`, `instance-type`,
/// `instance-id`, or `attribute:<name>` for a custom attribute. The
/// `attribute:ecs.availability-zone` / `attribute:ecs.instance-type`
/// spellings are accepted as aliases for the built-ins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlacementField {
    AvailabilityZone,
    InstanceType,
    InstanceId,
    Attribute(String),
}

impl From<String> for PlacementField {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "availability-zone" | "attribute:ecs.availability-zone" => Self::AvailabilityZone,
            "instance-type" | "attribute:ecs.instance-type" => Self::InstanceType,
            "instance-id" | "instanceId" => Self::InstanceId,
            _ => match raw.strip_prefix("attribute:") {
                Some(name) => Self::Attribute(name.to_string()),
                None => Self::Attribute(raw),
            },
        }
    }
}

impl From<PlacementField> for String {
    fn from(field: PlacementField) -> Self {
        field.to_string()
    }
}

impl fmt::Display for PlacementField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AvailabilityZone => f.write_str("availability-zone"),
            Self::InstanceType => f.write_str("instance-type"),
            Self::InstanceId => f.write_str("instance-id"),
            Self::Attribute(name) => write!(f, "attribute:{name}"),
        }
    }
}

/// Ordering rule applied to candidate instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlacementStrategy {
    /// Balance the service's tasks across values of `field`.
    Spread { field: PlacementField },
    /// Pack tasks onto the instance with the least remaining `resource`.
    Binpack { resource: ResourceKind },
}

/// Hard filter on eligible instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlacementConstraint {
    /// At most one task of the service per instance.
    DistinctInstance,
    /// The instance's `attribute` must equal one of `values`.
    MemberOf {
        attribute: PlacementField,
        values: Vec<String>,
    },
}

// ── Services ──────────────────────────────────────────────────────

/// A versioned task definition. Bridge networking with a dynamic host
/// port is assumed whenever `container_port` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub family: String,
    pub revision: u32,
    pub cpu: u32,
    pub memory: u32,
    #[serde(default)]
    pub container_port: Option<u16>,
}

impl TaskDefinition {
    /// `family:revision`.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.family, self.revision)
    }

    pub fn requirements(&self) -> Resources {
        Resources::new(self.cpu, self.memory)
    }
}

/// Rolling deployment bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPolicy {
    #[serde(default = "default_min_healthy_percent")]
    pub minimum_healthy_percent: u32,
    #[serde(default = "default_maximum_percent")]
    pub maximum_percent: u32,
    /// How long a batch may wait for its replacement tasks to turn healthy.
    #[serde(with = "duration::serde_str", default = "default_health_check_timeout")]
    pub health_check_timeout: Duration,
    #[serde(with = "duration::serde_str", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
}

fn default_min_healthy_percent() -> u32 {
    100
}

fn default_maximum_percent() -> u32 {
    200
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for DeploymentPolicy {
    fn default() -> Self {
        Self {
            minimum_healthy_percent: default_min_healthy_percent(),
            maximum_percent: default_maximum_percent(),
            health_check_timeout: default_health_check_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

/// Utilization metric a target-tracking policy follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    #[serde(rename = "cpu", alias = "ECSServiceAverageCPUUtilization")]
    CpuUtilization,
    #[serde(rename = "memory", alias = "ECSServiceAverageMemoryUtilization")]
    MemoryUtilization,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuUtilization => f.write_str("cpu"),
            Self::MemoryUtilization => f.write_str("memory"),
        }
    }
}

/// Target-tracking policy on a service's desired count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetTrackingPolicy {
    pub metric: MetricType,
    /// Target utilization in percent.
    pub target_value: f64,
    pub min_capacity: u32,
    pub max_capacity: u32,
    #[serde(with = "duration::serde_str", default = "default_scale_out_cooldown")]
    pub scale_out_cooldown: Duration,
    #[serde(with = "duration::serde_str", default = "default_scale_in_cooldown")]
    pub scale_in_cooldown: Duration,
    /// Relative band around the target inside which no action is taken.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_scale_out_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_scale_in_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_tolerance() -> f64 {
    0.1
}

/// Load balancer target group binding for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerBinding {
    pub container_port: u16,
}

/// A long-running service: N copies of one task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: ServiceId,
    pub task_definition: TaskDefinition,
    pub desired_count: u32,
    #[serde(default)]
    pub placement_strategies: Vec<PlacementStrategy>,
    #[serde(default)]
    pub placement_constraints: Vec<PlacementConstraint>,
    #[serde(default)]
    pub deployment: DeploymentPolicy,
    #[serde(default)]
    pub scaling: Option<TargetTrackingPolicy>,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerBinding>,
}

// ── Capacity ──────────────────────────────────────────────────────

/// Binds an instance group to the cluster's managed scaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityProviderSpec {
    pub name: String,
    pub instance_type: String,
    /// Zones new instances are spread over.
    #[serde(default)]
    pub availability_zones: Vec<String>,
    /// CPU units of one instance from the launch template.
    pub instance_cpu: u32,
    /// Memory (MiB) of one instance from the launch template.
    pub instance_memory: u32,
    /// Desired utilization of the group, 1..=100.
    #[serde(default = "default_target_capacity")]
    pub target_capacity_percent: u32,
    #[serde(default = "default_min_step")]
    pub min_step: u32,
    #[serde(default = "default_max_step")]
    pub max_step: u32,
    #[serde(default)]
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub managed_termination_protection: bool,
}

fn default_target_capacity() -> u32 {
    100
}

fn default_min_step() -> u32 {
    1
}

fn default_max_step() -> u32 {
    10_000
}

impl CapacityProviderSpec {
    pub fn instance_resources(&self) -> Resources {
        Resources::new(self.instance_cpu, self.instance_memory)
    }
}

/// An instance as reported by the instance group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub id: InstanceId,
    pub availability_zone: String,
    pub instance_type: String,
    pub resources: Resources,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Unix timestamp (seconds) of launch.
    pub launched_at: u64,
    #[serde(default)]
    pub protected_from_scale_in: bool,
}
