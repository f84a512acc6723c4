//! Scheduler error types.

use fleetgrid_placement::PlacementFailure;
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// No instance can ever host the task. Not retried.
    #[error(transparent)]
    ConstraintViolation(PlacementFailure),

    #[error("registry error: {0}")]
    Registry(#[from] fleetgrid_state::RegistryError),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
