//! Health monitor — records task health in the registry.
//!
//! Each sweep asks the health-check collaborator about every RUNNING task
//! and writes changes back to the [`ClusterRegistry`], where the scheduler
//! picks up unhealthy tasks for replacement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetgrid_core::{HealthCheck, TaskId};
use fleetgrid_state::{ClusterRegistry, HealthStatus, TaskState};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub healthy: u32,
    pub unhealthy: u32,
    /// Still inside the startup grace period.
    pub starting: u32,
    /// Tasks whose recorded status changed this sweep.
    pub changed: Vec<TaskId>,
}

pub struct HealthMonitor {
    registry: ClusterRegistry,
    check: Arc<dyn HealthCheck>,
    /// How long a never-healthy task stays `Unknown`.
    grace_period: Duration,
    first_seen: Mutex<HashMap<TaskId, Instant>>,
}

impl HealthMonitor {
    pub fn new(registry: ClusterRegistry, check: Arc<dyn HealthCheck>, grace_period: Duration) -> Self {
        Self {
            registry,
            check,
            grace_period,
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Check every running task once.
    pub async fn sweep(&self) -> HealthSweep {
        let now = Instant::now();
        let running: Vec<_> = self
            .registry
            .tasks()
            .await
            .into_iter()
            .filter(|t| t.state == TaskState::Running)
            .collect();

        let mut first_seen = self.first_seen.lock().await;
        first_seen.retain(|id, _| running.iter().any(|t| &t.id == id));

        let mut sweep = HealthSweep::default();
        for task in running {
            let seen = *first_seen.entry(task.id.clone()).or_insert(now);
            let status = if self.check.is_healthy(&task.id).await {
                sweep.healthy += 1;
                HealthStatus::Healthy
            } else if task.health == HealthStatus::Unknown
                && now.duration_since(seen) < self.grace_period
            {
                sweep.starting += 1;
                HealthStatus::Unknown
            } else {
                sweep.unhealthy += 1;
                HealthStatus::Unhealthy
            };

            if status != task.health {
                match self.registry.set_task_health(&task.id, status).await {
                    Ok(_) => {
                        if status == HealthStatus::Unhealthy {
                            warn!(task = %task.id, service = %task.service, "task unhealthy");
                        } else {
                            debug!(task = %task.id, service = %task.service, ?status, "task health changed");
                        }
                        sweep.changed.push(task.id.clone());
                    }
                    // Stopped and purged between listing and update.
                    Err(e) => debug!(task = %task.id, error = %e, "health update skipped"),
                }
            }
        }
        sweep
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sweep = self.sweep().await;
                    if !sweep.changed.is_empty() {
                        debug!(
                            healthy = sweep.healthy,
                            unhealthy = sweep.unhealthy,
                            starting = sweep.starting,
                            changed = sweep.changed.len(),
                            "health sweep"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use fleetgrid_core::{InstanceDescription, Resources, TaskDefinition};
    use fleetgrid_state::{InstanceRecord, ReservationRequest};

    #[derive(Default)]
    struct SetHealth(std::sync::Mutex<HashSet<String>>);

    impl SetHealth {
        fn mark(&self, task: &str) {
            self.0.lock().unwrap().insert(task.to_string());
        }
    }

    #[async_trait]
    impl HealthCheck for SetHealth {
        async fn is_healthy(&self, task_id: &str) -> bool {
            self.0.lock().unwrap().contains(task_id)
        }
    }

    async fn running_tasks(n: usize) -> (ClusterRegistry, Vec<TaskId>) {
        let registry = ClusterRegistry::new();
        registry
            .register_instance(InstanceRecord::from_description(&InstanceDescription {
                id: "i-1".to_string(),
                availability_zone: "az-a".to_string(),
                instance_type: "m5.large".to_string(),
                resources: Resources::new(4096, 8192),
                attributes: HashMap::new(),
                launched_at: 0,
                protected_from_scale_in: false,
            }))
            .await;
        let def = TaskDefinition {
            family: "web".to_string(),
            revision: 1,
            cpu: 128,
            memory: 128,
            container_port: None,
        };
        let mut ids = Vec::new();
        for _ in 0..n {
            let task = registry.create_task("web", &def).await;
            let r = registry.try_reserve("i-1", &ReservationRequest::new(task.service.clone(), task.requirements)).await.unwrap();
            registry.bind_task(&task.id, &r).await.unwrap();
            ids.push(task.id);
        }
        (registry, ids)
    }

    #[tokio::test]
    async fn sweep_records_health() {
        let (registry, ids) = running_tasks(2).await;
        let check = Arc::new(SetHealth::default());
        check.mark(&ids[0]);
        let monitor = HealthMonitor::new(registry.clone(), check, Duration::ZERO);

        let sweep = monitor.sweep().await;
        assert_eq!((sweep.healthy, sweep.unhealthy), (1, 1));
        assert_eq!(sweep.changed.len(), 2);
        assert_eq!(registry.task(&ids[0]).await.unwrap().health, HealthStatus::Healthy);
        assert_eq!(registry.task(&ids[1]).await.unwrap().health, HealthStatus::Unhealthy);

        // Nothing changes on an identical second sweep.
        assert!(monitor.sweep().await.changed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_tasks_get_a_grace_period() {
        let (registry, ids) = running_tasks(1).await;
        let check = Arc::new(SetHealth::default());
        let monitor = HealthMonitor::new(registry.clone(), check, Duration::from_secs(10));

        let sweep = monitor.sweep().await;
        assert_eq!(sweep.starting, 1);
        assert_eq!(registry.task(&ids[0]).await.unwrap().health, HealthStatus::Unknown);

        tokio::time::advance(Duration::from_secs(11)).await;
        let sweep = monitor.sweep().await;
        assert_eq!(sweep.unhealthy, 1);
        assert_eq!(registry.task(&ids[0]).await.unwrap().health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (registry, _) = running_tasks(0).await;
        let monitor = Arc::new(HealthMonitor::new(
            registry,
            Arc::new(SetHealth::default()),
            Duration::ZERO,
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run(Duration::from_millis(10), rx).await }
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
