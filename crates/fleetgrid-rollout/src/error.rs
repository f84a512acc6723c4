//! Deployment failure reasons.

use serde::Serialize;
use thiserror::Error;

use fleetgrid_core::{ServiceId, TaskId};

/// How far a deployment got before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentProgress {
    /// Batches started.
    pub batches: u32,
    pub new_running: u32,
    pub new_healthy: u32,
    /// Old-revision tasks not yet stopped.
    pub old_active: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploymentFailure {
    /// New tasks did not turn healthy within the policy timeout. Tasks are
    /// left as they are; there is no automatic rollback.
    #[error("{} task(s) not healthy before the timeout", unhealthy.len())]
    HealthCheckTimeout {
        unhealthy: Vec<TaskId>,
        progress: DeploymentProgress,
    },

    #[error("{message}")]
    ConstraintViolation { message: String },

    /// The policy cannot move a single task per batch.
    #[error(
        "invalid deployment policy for {desired} task(s): minimum_healthy_percent={minimum_healthy_percent} maximum_percent={maximum_percent}"
    )]
    InvalidPolicy {
        desired: u32,
        minimum_healthy_percent: u32,
        maximum_percent: u32,
    },

    #[error("a deployment of {service} is already in progress")]
    AlreadyInProgress { service: ServiceId },

    #[error("service not found: {service}")]
    UnknownService { service: ServiceId },

    #[error("scheduler error: {message}")]
    Scheduler { message: String },
}
