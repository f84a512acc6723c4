//! Interfaces to the collaborators the control loops drive.
//!
//! None of these are implemented here: the instance group, the metrics
//! pipeline, health checks, and the load balancer are all external. `fleetd`
//! ships in-process simulations of each; tests use small fakes.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{InstanceDescription, MetricType};

/// The auto scaling group backing a capacity provider.
#[async_trait]
pub trait InstanceGroupProvider: Send + Sync {
    /// Instances currently in the group.
    async fn list_instances(&self) -> Result<Vec<InstanceDescription>>;

    /// Set the group's desired size. Fire-and-forget: the group converges
    /// on its own schedule.
    async fn scale_to(&self, desired: u32) -> Result<()>;

    /// Toggle scale-in protection on one instance.
    async fn protect_from_scale_in(&self, instance_id: &str, protected: bool) -> Result<()>;
}

/// Averaged service utilization, in percent.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// `None` when no datapoints exist for the current period.
    async fn get_utilization(&self, service_id: &str, metric: MetricType) -> Result<Option<f64>>;
}

/// Health-check collaborator (e.g. a load balancer's target health).
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn is_healthy(&self, task_id: &str) -> bool;
}

/// Load balancer target group registration.
///
/// Targets are `(instance, host port)` pairs; bridge networking lets several
/// tasks share one instance on different ports.
#[async_trait]
pub trait TargetRegistration: Send + Sync {
    async fn register_target(&self, instance_id: &str, port: u16) -> Result<()>;

    async fn deregister_target(&self, instance_id: &str, port: u16) -> Result<()>;
}
