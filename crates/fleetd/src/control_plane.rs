//! Control plane assembly.
//!
//! Builds the registry, restores persisted state, seeds services from
//! `fleet.toml`, and runs each control loop on its own cadence:
//! 1. Service scheduler (reconcile tasks, persist snapshot)
//! 2. Health monitor (record task health)
//! 3. Service scaler (target tracking)
//! 4. Capacity scaler (instance group sizing, termination protection)
//! 5. Simulated load (feeds the metrics collector)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleetgrid_autoscale::ServiceScaler;
use fleetgrid_capacity::CapacityScaler;
use fleetgrid_core::{FleetConfig, HealthCheck, InstanceGroupProvider, ServiceSpec};
use fleetgrid_health::HealthMonitor;
use fleetgrid_metrics::UtilizationCollector;
use fleetgrid_placement::PlacementEngine;
use fleetgrid_rollout::DeploymentController;
use fleetgrid_scheduler::ServiceScheduler;
use fleetgrid_state::{ClusterRegistry, StateStore, TaskState};

use crate::sim::{LoadGenerator, SimulatedHealth, SimulatedInstanceGroup, SimulatedLoadBalancer};

pub struct ControlPlane {
    config: FleetConfig,
    registry: ClusterRegistry,
    group: Arc<SimulatedInstanceGroup>,
    balancer: Arc<SimulatedLoadBalancer>,
    health: Arc<SimulatedHealth>,
    scheduler: Arc<ServiceScheduler>,
    monitor: Arc<HealthMonitor>,
    service_scaler: Arc<Mutex<ServiceScaler>>,
    capacity: Arc<Mutex<CapacityScaler>>,
    load: Arc<LoadGenerator>,
}

impl ControlPlane {
    /// Assemble the control plane. With a store, the registry is restored
    /// from its last snapshot and every scheduler pass saves a new one.
    pub async fn new(config: FleetConfig, store: Option<StateStore>) -> Result<Self> {
        let registry = ClusterRegistry::new();
        let group = Arc::new(SimulatedInstanceGroup::new(config.capacity_provider.clone()));

        if let Some(store) = &store {
            let snapshot = store.load_snapshot().context("loading registry snapshot")?;
            if !snapshot.instances.is_empty() || !snapshot.services.is_empty() {
                info!(
                    instances = snapshot.instances.len(),
                    tasks = snapshot.tasks.len(),
                    services = snapshot.services.len(),
                    "registry restored"
                );
                group.adopt(&snapshot.instances).await;
                registry.restore(snapshot).await;
            }
        }

        seed_services(&registry, &config.services).await;

        if group.is_empty().await {
            group
                .scale_to(config.simulation.initial_instances)
                .await
                .context("launching initial instances")?;
        }

        let balancer = Arc::new(SimulatedLoadBalancer::new());
        let health = Arc::new(SimulatedHealth::new(
            registry.clone(),
            config.simulation.startup_delay,
        ));
        let collector = Arc::new(UtilizationCollector::default());

        let mut scheduler =
            ServiceScheduler::new(PlacementEngine::new(registry.clone()), balancer.clone());
        if let Some(store) = store {
            scheduler = scheduler.with_store(store);
        }

        Ok(Self {
            monitor: Arc::new(HealthMonitor::new(
                registry.clone(),
                health.clone(),
                config.loops.health_grace_period,
            )),
            service_scaler: Arc::new(Mutex::new(ServiceScaler::new(
                registry.clone(),
                collector.clone(),
            ))),
            capacity: Arc::new(Mutex::new(
                CapacityScaler::new(
                    config.capacity_provider.clone(),
                    registry.clone(),
                    group.clone(),
                )
                .with_targets(balancer.clone()),
            )),
            load: Arc::new(LoadGenerator::new(
                registry.clone(),
                collector,
                config.simulation.service_load.clone(),
            )),
            scheduler: Arc::new(scheduler),
            config,
            registry,
            group,
            balancer,
            health,
        })
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn group(&self) -> &Arc<SimulatedInstanceGroup> {
        &self.group
    }

    pub fn balancer(&self) -> &Arc<SimulatedLoadBalancer> {
        &self.balancer
    }

    pub fn deployments(&self) -> DeploymentController {
        DeploymentController::new(self.scheduler.clone(), self.health.clone())
    }

    /// One pass of every loop, in dependency order.
    pub async fn step(&self) {
        if let Err(e) = self.capacity.lock().await.run_cycle().await {
            warn!(error = %e, "capacity cycle failed");
        }
        self.monitor.sweep().await;
        self.load.sample().await;
        self.service_scaler.lock().await.evaluate_all().await;
        self.scheduler.reconcile_all().await;
        self.registry.purge_stopped_tasks().await;
        self.persist().await;
    }

    /// Save a registry snapshot, if a store is attached.
    pub async fn persist(&self) {
        self.scheduler.persist().await;
    }

    /// Spawn every loop. They stop once `shutdown` flips to true.
    pub fn spawn_loops(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let loops = &self.config.loops;
        let mut handles = Vec::new();

        let scheduler = self.scheduler.clone();
        let (interval, rx) = (loops.service_interval, shutdown.clone());
        handles.push(tokio::spawn(async move { scheduler.run(interval, rx).await }));

        let monitor = self.monitor.clone();
        let (interval, rx) = (loops.health_interval, shutdown.clone());
        handles.push(tokio::spawn(async move { monitor.run(interval, rx).await }));

        let scaler = self.service_scaler.clone();
        let (interval, rx) = (loops.autoscale_interval, shutdown.clone());
        handles.push(tokio::spawn(async move { scaler.lock().await.run(interval, rx).await }));

        let capacity = self.capacity.clone();
        let (interval, rx) = (loops.capacity_interval, shutdown.clone());
        handles.push(tokio::spawn(async move { capacity.lock().await.run(interval, rx).await }));

        if !self.config.simulation.service_load.is_empty() {
            let load = self.load.clone();
            // Several samples per scaler period so the window has data.
            let interval = (loops.autoscale_interval / 4).max(Duration::from_millis(100));
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move { load.run(interval, rx).await }));
        }

        info!(loops = handles.len(), "control loops started");
        handles
    }

    /// Poll until `service` has its desired number of running tasks, all
    /// reported healthy, or `timeout` passes.
    pub async fn wait_for_service(&self, service: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let spec = self
                .registry
                .service(service)
                .await
                .with_context(|| format!("unknown service {service}"))?;
            let mut healthy = 0;
            for task in self.registry.active_tasks_for_service(service).await {
                if task.state == TaskState::Running
                    && self.health.is_healthy(&task.id).await
                {
                    healthy += 1;
                }
            }
            if healthy >= spec.desired_count {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "service {service} has {healthy}/{} healthy tasks after {timeout:?}",
                    spec.desired_count
                );
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Store each configured service. A service already in the registry keeps
/// its desired count and task definition, which the scalers and
/// deployments own once the cluster is running.
async fn seed_services(registry: &ClusterRegistry, services: &[ServiceSpec]) {
    for spec in services {
        let mut spec = spec.clone();
        if let Some(existing) = registry.service(&spec.name).await {
            spec.desired_count = existing.desired_count;
            spec.task_definition = existing.task_definition;
        }
        registry.put_service(spec).await;
    }
}
