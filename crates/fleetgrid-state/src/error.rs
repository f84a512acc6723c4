//! Error types for the cluster registry and the snapshot store.

use fleetgrid_core::{InstanceId, Resources, ServiceId, TaskId};
use thiserror::Error;

use crate::types::InstanceStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Errors raised by [`ClusterRegistry`](crate::ClusterRegistry) mutations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another writer holds the instance's critical section. Transient.
    #[error("instance {0} is being updated concurrently")]
    Contended(InstanceId),

    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("instance {instance} is {status:?} and accepts no new tasks")]
    NotSchedulable {
        instance: InstanceId,
        status: InstanceStatus,
    },

    #[error("instance {instance} has {available} free, {requested} requested")]
    InsufficientResources {
        instance: InstanceId,
        requested: Resources,
        available: Resources,
    },

    #[error("instance {0} has no free host port in the ephemeral range")]
    NoFreePort(InstanceId),

    #[error("instance {instance} already runs a task of {service}")]
    ServiceAlreadyPlaced {
        instance: InstanceId,
        service: ServiceId,
    },
}
