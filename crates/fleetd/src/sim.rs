//! In-process stand-ins for the instance group, load balancer, health
//! checks, and service load.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use fleetgrid_core::{
    CapacityProviderSpec, HealthCheck, InstanceDescription, InstanceGroupProvider, InstanceId,
    MetricType, ServiceId, TargetRegistration, TaskId,
};
use fleetgrid_metrics::UtilizationCollector;
use fleetgrid_state::{ClusterRegistry, InstanceRecord, TaskState};

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Instance group ────────────────────────────────────────────────

#[derive(Default)]
struct GroupState {
    instances: BTreeMap<InstanceId, InstanceDescription>,
    next_id: u32,
}

/// An auto scaling group that converges instantly.
///
/// New instances go to the zone with the fewest instances. Scale-in
/// terminates unprotected instances oldest first and never touches
/// protected ones, so the group may stay above the requested size.
pub struct SimulatedInstanceGroup {
    spec: CapacityProviderSpec,
    state: Mutex<GroupState>,
}

impl SimulatedInstanceGroup {
    pub fn new(spec: CapacityProviderSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(GroupState::default()),
        }
    }

    /// Start from instances that already exist (restored from a snapshot).
    pub async fn adopt(&self, records: &[InstanceRecord]) {
        let mut state = self.state.lock().await;
        for record in records {
            state.instances.insert(
                record.id.clone(),
                InstanceDescription {
                    id: record.id.clone(),
                    availability_zone: record.availability_zone.clone(),
                    instance_type: record.instance_type.clone(),
                    resources: record.total,
                    attributes: record.attributes.clone(),
                    launched_at: record.launched_at,
                    protected_from_scale_in: record.protected_from_scale_in,
                },
            );
            let seq = record
                .id
                .strip_prefix("i-")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .unwrap_or(0);
            state.next_id = state.next_id.max(seq);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Lose an instance outside any scaling action, as a hardware failure
    /// would. Returns false if the id is unknown.
    pub async fn terminate(&self, instance_id: &str) -> bool {
        let removed = self.state.lock().await.instances.remove(instance_id).is_some();
        if removed {
            info!(instance = %instance_id, "simulated instance lost");
        }
        removed
    }

    fn launch(&self, state: &mut GroupState) -> InstanceId {
        state.next_id += 1;
        let id = format!("i-{:08x}", state.next_id);

        let mut per_zone: BTreeMap<&str, usize> = self
            .spec
            .availability_zones
            .iter()
            .map(|z| (z.as_str(), 0))
            .collect();
        for desc in state.instances.values() {
            if let Some(n) = per_zone.get_mut(desc.availability_zone.as_str()) {
                *n += 1;
            }
        }
        let zone = per_zone
            .iter()
            .min_by_key(|(zone, n)| (**n, **zone))
            .map(|(zone, _)| zone.to_string())
            .unwrap_or_else(|| "default".to_string());

        let desc = InstanceDescription {
            id: id.clone(),
            availability_zone: zone,
            instance_type: self.spec.instance_type.clone(),
            resources: self.spec.instance_resources(),
            attributes: HashMap::new(),
            launched_at: epoch_secs(),
            protected_from_scale_in: false,
        };
        info!(instance = %id, zone = %desc.availability_zone, "simulated instance launched");
        state.instances.insert(id.clone(), desc);
        id
    }
}

#[async_trait]
impl InstanceGroupProvider for SimulatedInstanceGroup {
    async fn list_instances(&self) -> Result<Vec<InstanceDescription>> {
        Ok(self.state.lock().await.instances.values().cloned().collect())
    }

    async fn scale_to(&self, desired: u32) -> Result<()> {
        let desired = desired.clamp(self.spec.min_size, self.spec.max_size) as usize;
        let mut state = self.state.lock().await;

        while state.instances.len() < desired {
            self.launch(&mut state);
        }

        while state.instances.len() > desired {
            let victim = state
                .instances
                .values()
                .filter(|d| !d.protected_from_scale_in)
                .min_by(|a, b| a.launched_at.cmp(&b.launched_at).then_with(|| a.id.cmp(&b.id)))
                .map(|d| d.id.clone());
            let Some(id) = victim else {
                debug!(remaining = state.instances.len(), desired, "only protected instances left");
                break;
            };
            state.instances.remove(&id);
            info!(instance = %id, "simulated instance terminated");
        }
        Ok(())
    }

    async fn protect_from_scale_in(&self, instance_id: &str, protected: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.instances.get_mut(instance_id) {
            Some(desc) => {
                desc.protected_from_scale_in = protected;
                Ok(())
            }
            None => bail!("no such instance: {instance_id}"),
        }
    }
}

// ── Load balancer ─────────────────────────────────────────────────

/// A target group that records `(instance, port)` registrations.
#[derive(Default)]
pub struct SimulatedLoadBalancer {
    targets: Mutex<BTreeSet<(InstanceId, u16)>>,
}

impl SimulatedLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn targets(&self) -> Vec<(InstanceId, u16)> {
        self.targets.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl TargetRegistration for SimulatedLoadBalancer {
    async fn register_target(&self, instance_id: &str, port: u16) -> Result<()> {
        if !self.targets.lock().await.insert((instance_id.to_string(), port)) {
            bail!("target {instance_id}:{port} already registered");
        }
        debug!(instance = %instance_id, port, "target registered");
        Ok(())
    }

    async fn deregister_target(&self, instance_id: &str, port: u16) -> Result<()> {
        self.targets.lock().await.remove(&(instance_id.to_string(), port));
        debug!(instance = %instance_id, port, "target deregistered");
        Ok(())
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Reports a running task healthy once `startup_delay` has passed since it
/// was first asked about.
pub struct SimulatedHealth {
    registry: ClusterRegistry,
    startup_delay: Duration,
    first_seen: Mutex<HashMap<TaskId, Instant>>,
}

impl SimulatedHealth {
    pub fn new(registry: ClusterRegistry, startup_delay: Duration) -> Self {
        Self {
            registry,
            startup_delay,
            first_seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HealthCheck for SimulatedHealth {
    async fn is_healthy(&self, task_id: &str) -> bool {
        let running = self
            .registry
            .task(task_id)
            .await
            .is_some_and(|t| t.state == TaskState::Running);
        let mut first_seen = self.first_seen.lock().await;
        if !running {
            first_seen.remove(task_id);
            return false;
        }
        let seen = *first_seen.entry(task_id.to_string()).or_insert_with(Instant::now);
        seen.elapsed() >= self.startup_delay
    }
}

// ── Load ──────────────────────────────────────────────────────────

/// Feeds the collector with utilization derived from a fixed offered load:
/// `load / running_tasks * 100`, for both cpu and memory.
pub struct LoadGenerator {
    registry: ClusterRegistry,
    collector: Arc<UtilizationCollector>,
    load: HashMap<ServiceId, f64>,
}

impl LoadGenerator {
    pub fn new(
        registry: ClusterRegistry,
        collector: Arc<UtilizationCollector>,
        load: HashMap<ServiceId, f64>,
    ) -> Self {
        Self {
            registry,
            collector,
            load,
        }
    }

    /// Record one sample per loaded service.
    pub async fn sample(&self) {
        for (service, load) in &self.load {
            let running = self
                .registry
                .active_tasks_for_service(service)
                .await
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .count();
            // With nothing running, report the load as if one task carried it.
            let percent = load * 100.0 / running.max(1) as f64;
            for metric in [MetricType::CpuUtilization, MetricType::MemoryUtilization] {
                self.collector.record(service, metric, percent).await;
            }
            debug!(%service, running, percent, "load sampled");
        }
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
