//! HttpHealthCheck — probe-backed health-check collaborator.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use fleetgrid_core::{HealthCheck, TaskId};
use fleetgrid_state::HealthStatus;

use crate::checker::{DEFAULT_UNHEALTHY_THRESHOLD, HealthTracker, http_probe};

struct ProbeTarget {
    address: String,
    tracker: HealthTracker,
}

/// Probes each registered task's HTTP endpoint on every `is_healthy` call
/// and reports the tracker's verdict.
pub struct HttpHealthCheck {
    path: String,
    timeout: Duration,
    unhealthy_threshold: u32,
    interval: Duration,
    targets: Mutex<HashMap<TaskId, ProbeTarget>>,
}

impl HttpHealthCheck {
    pub fn new(path: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            interval,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    /// Start probing `task_id` at `address` (`host:port`).
    pub async fn register(&self, task_id: &str, address: impl Into<String>) {
        let address = address.into();
        debug!(task = %task_id, %address, "health target registered");
        self.targets.lock().await.insert(
            task_id.to_string(),
            ProbeTarget {
                address,
                tracker: HealthTracker::new(self.unhealthy_threshold, self.interval),
            },
        );
    }

    pub async fn deregister(&self, task_id: &str) {
        self.targets.lock().await.remove(task_id);
    }

    /// Last verdict for a task without probing again.
    pub async fn status(&self, task_id: &str) -> Option<HealthStatus> {
        self.targets
            .lock()
            .await
            .get(task_id)
            .map(|t| t.tracker.status())
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn is_healthy(&self, task_id: &str) -> bool {
        let Some(address) = self
            .targets
            .lock()
            .await
            .get(task_id)
            .map(|t| t.address.clone())
        else {
            return false;
        };

        // Probe without holding the lock.
        let result = http_probe(&address, &self.path, self.timeout).await;

        let mut targets = self.targets.lock().await;
        match targets.get_mut(task_id) {
            Some(target) => target.tracker.record(result) == HealthStatus::Healthy,
            None => false,
        }
    }
}
