//! Bounded waits on task health.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use fleetgrid_core::{HealthCheck, TaskId};

/// Tasks still not healthy when the wait ran out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} task(s) not healthy after {timeout:?}", unhealthy.len())]
pub struct HealthWaitTimeout {
    pub unhealthy: Vec<TaskId>,
    pub timeout: Duration,
}

/// The subset of `tasks` the check does not currently report healthy.
pub async fn unhealthy_tasks(check: &dyn HealthCheck, tasks: &[TaskId]) -> Vec<TaskId> {
    let mut unhealthy = Vec::new();
    for task in tasks {
        if !check.is_healthy(task).await {
            unhealthy.push(task.clone());
        }
    }
    unhealthy
}

/// Poll every `interval` until all `tasks` have been seen healthy.
///
/// A task that reports healthy once is not probed again during the wait.
pub async fn wait_until_healthy(
    check: &dyn HealthCheck,
    tasks: &[TaskId],
    timeout: Duration,
    interval: Duration,
) -> Result<(), HealthWaitTimeout> {
    let deadline = Instant::now() + timeout;
    let mut waiting = tasks.to_vec();

    loop {
        waiting = unhealthy_tasks(check, &waiting).await;
        if waiting.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(HealthWaitTimeout {
                unhealthy: waiting,
                timeout,
            });
        }
        debug!(waiting = waiting.len(), "waiting for tasks to become healthy");
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
