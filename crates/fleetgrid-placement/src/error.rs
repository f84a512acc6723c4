//! Placement error types.

use fleetgrid_core::{InstanceId, Resources, ServiceId};
use fleetgrid_state::RegistryError;
use thiserror::Error;

/// Why no instance was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// Some instance could host the task but none has room right now.
    #[error("insufficient capacity")]
    InsufficientCapacity,

    /// No instance can ever host the task under its constraints.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// A placement decision that found no instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot place task of service {service} ({requirements}): {reason}")]
pub struct PlacementFailure {
    pub service: ServiceId,
    pub requirements: Resources,
    pub reason: FailureReason,
}

impl PlacementFailure {
    /// Insufficient capacity clears once instances are added or freed.
    pub fn is_retryable(&self) -> bool {
        self.reason == FailureReason::InsufficientCapacity
    }
}

/// Errors from [`PlacementEngine`](crate::PlacementEngine).
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error(transparent)]
    Failed(#[from] PlacementFailure),

    /// The chosen instance stayed locked through every retry.
    #[error("instance {instance} still contended after {attempts} attempts")]
    RegistryContention { instance: InstanceId, attempts: u32 },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl PlacementError {
    /// Whether the task should stay pending and be retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed(failure) => failure.is_retryable(),
            Self::RegistryContention { .. } => true,
            Self::Registry(_) => false,
        }
    }
}
