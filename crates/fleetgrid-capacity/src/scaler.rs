//! CapacityScaler — keeps the instance group sized to the cluster's work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_core::{CapacityProviderSpec, InstanceGroupProvider, InstanceId, TargetRegistration};
use fleetgrid_state::{ClusterRegistry, InstanceRecord, InstanceStatus, TaskRecord};

use crate::reconcile::{ClusterUtilization, InstanceUsage, ScalingAction, reconcile};

/// What one sync with the instance group changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub registered: Vec<InstanceId>,
    pub removed: Vec<InstanceId>,
    /// Tasks stopped because their instance disappeared.
    pub orphaned_tasks: usize,
    /// The group matched the last requested size.
    pub converged: bool,
}

pub struct CapacityScaler {
    spec: CapacityProviderSpec,
    registry: ClusterRegistry,
    group: Arc<dyn InstanceGroupProvider>,
    targets: Option<Arc<dyn TargetRegistration>>,
    /// Group size requested by the last scaling action.
    last_target: Option<u32>,
}

impl CapacityScaler {
    pub fn new(
        spec: CapacityProviderSpec,
        registry: ClusterRegistry,
        group: Arc<dyn InstanceGroupProvider>,
    ) -> Self {
        Self {
            spec,
            registry,
            group,
            targets: None,
            last_target: None,
        }
    }

    /// Deregister load-balancer targets of tasks lost with their instance.
    pub fn with_targets(mut self, targets: Arc<dyn TargetRegistration>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Register instances the group reports that the registry lacks, and
    /// remove registry instances the group no longer has.
    ///
    /// Once the group has converged on the last requested size, instances
    /// still marked draining were not the ones it terminated and go back in
    /// service.
    pub async fn sync_instances(&self) -> Result<SyncReport> {
        let listed = self
            .group
            .list_instances()
            .await
            .context("listing instance group")?;
        let listed_ids: HashSet<&str> = listed.iter().map(|d| d.id.as_str()).collect();

        let mut report = SyncReport::default();
        for desc in &listed {
            if self
                .registry
                .register_instance(InstanceRecord::from_description(desc))
                .await
            {
                report.registered.push(desc.id.clone());
            }
        }

        for id in self.registry.instance_ids().await {
            if listed_ids.contains(id.as_str()) {
                continue;
            }
            if let Some((_, orphaned)) = self.registry.remove_instance(&id).await {
                report.orphaned_tasks += orphaned.len();
                for task in &orphaned {
                    self.deregister_orphan(task).await;
                }
                report.removed.push(id);
            }
        }

        report.converged = self
            .last_target
            .is_none_or(|target| listed.len() as u32 <= target);
        if report.converged {
            for record in self.registry.instances().await {
                if record.status == InstanceStatus::Draining {
                    info!(instance = %record.id, "instance survived scale-in; back in service");
                    self.registry
                        .set_instance_status(&record.id, InstanceStatus::InService)
                        .await?;
                }
            }
        }

        if !report.registered.is_empty() || !report.removed.is_empty() {
            info!(
                registered = report.registered.len(),
                removed = report.removed.len(),
                orphaned_tasks = report.orphaned_tasks,
                "instance group synced"
            );
        }
        Ok(report)
    }

    async fn deregister_orphan(&self, task: &TaskRecord) {
        let Some(targets) = &self.targets else {
            return;
        };
        let (Some(instance), Some(port)) = (&task.instance_id, task.host_port) else {
            return;
        };
        let balanced = self
            .registry
            .service(&task.service)
            .await
            .is_some_and(|s| s.load_balancer.is_some());
        if !balanced {
            return;
        }
        match targets.deregister_target(instance, port).await {
            Ok(()) => debug!(task = %task.id, %instance, port, "orphaned target deregistered"),
            Err(e) => {
                warn!(task = %task.id, %instance, port, error = %e, "orphaned target deregistration failed")
            }
        }
    }

    /// Managed termination protection: protect instances running tasks and
    /// unprotect idle ones. Returns how many flags changed.
    pub async fn apply_protection(&self) -> usize {
        if !self.spec.managed_termination_protection {
            return 0;
        }

        let active = self.registry.active_tasks_by_instance().await;
        let mut changed = 0;
        for record in self.registry.instances().await {
            let want = active.get(&record.id).copied().unwrap_or(0) > 0;
            if record.protected_from_scale_in == want {
                continue;
            }
            if let Err(e) = self.group.protect_from_scale_in(&record.id, want).await {
                warn!(instance = %record.id, error = %e, "failed to update scale-in protection");
                continue;
            }
            if self.registry.set_protection(&record.id, want).await.is_ok() {
                debug!(instance = %record.id, protected = want, "scale-in protection updated");
                changed += 1;
            }
        }
        changed
    }

    /// Snapshot instance usage and the pending backlog from the registry.
    pub async fn utilization(&self) -> ClusterUtilization {
        let active = self.registry.active_tasks_by_instance().await;
        let instances = self
            .registry
            .instances()
            .await
            .into_iter()
            .filter(|r| r.status != InstanceStatus::Terminating)
            .map(|r| InstanceUsage {
                active_tasks: active.get(&r.id).copied().unwrap_or(0),
                id: r.id,
                status: r.status,
                available: r.available,
                launched_at: r.launched_at,
                protected: r.protected_from_scale_in,
            })
            .collect();
        let pending = self
            .registry
            .pending_tasks()
            .await
            .into_iter()
            .map(|t| t.requirements)
            .collect();
        ClusterUtilization { instances, pending }
    }

    /// One full pass: sync, protection, decide, act.
    ///
    /// No further scale-in is issued until the group has shrunk to the last
    /// requested size.
    pub async fn run_cycle(&mut self) -> Result<ScalingAction> {
        let sync = self.sync_instances().await?;
        self.apply_protection().await;

        let utilization = self.utilization().await;
        let current = utilization.current();
        let mut action = reconcile(&self.spec, &utilization);
        if !sync.converged && matches!(action, ScalingAction::ScaleIn { .. }) {
            debug!(
                provider = %self.spec.name,
                target = ?self.last_target,
                "previous scale-in still in flight"
            );
            action = ScalingAction::NoAction;
        }

        match &action {
            ScalingAction::ScaleOut(n) => {
                let desired = current + n;
                info!(
                    provider = %self.spec.name,
                    from = current,
                    to = desired,
                    pending = utilization.pending.len(),
                    "scaling out"
                );
                self.group.scale_to(desired).await.context("scale out")?;
                self.last_target = Some(desired);
            }
            ScalingAction::ScaleIn { instances } => {
                for id in instances {
                    self.registry
                        .set_instance_status(id, InstanceStatus::Draining)
                        .await?;
                }
                let desired = current.saturating_sub(instances.len() as u32);
                info!(
                    provider = %self.spec.name,
                    from = current,
                    to = desired,
                    draining = ?instances,
                    "scaling in"
                );
                self.group.scale_to(desired).await.context("scale in")?;
                self.last_target = Some(desired);
            }
            ScalingAction::NoAction => {
                debug!(provider = %self.spec.name, size = current, "capacity steady");
            }
        }
        Ok(action)
    }

    /// Run cycles on every tick until `shutdown` flips to true.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            provider = %self.spec.name,
            interval_secs = interval.as_secs(),
            "capacity scaler started"
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(provider = %self.spec.name, error = %e, "capacity cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("capacity scaler shutting down");
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
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use fleetgrid_core::{
        DeploymentPolicy, InstanceDescription, LoadBalancerBinding, Resources, ServiceSpec,
        TaskDefinition,
    };
    use fleetgrid_state::ReservationRequest;

    /// Instance group that applies `scale_to` immediately: new instances are
    /// appended, scale-in removes unprotected instances oldest first. A
    /// frozen group only records the request.
    #[derive(Default)]
    struct FakeGroup {
        instances: Mutex<BTreeMap<String, InstanceDescription>>,
        next_id: Mutex<u32>,
        scale_calls: Mutex<Vec<u32>>,
        frozen: Mutex<bool>,
    }

    impl FakeGroup {
        fn with_instances(n: u32) -> Self {
            let group = Self::default();
            for _ in 0..n {
                group.launch();
            }
            group
        }

        fn launch(&self) {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = format!("i-{:03}", *next);
            self.instances.lock().unwrap().insert(
                id.clone(),
                InstanceDescription {
                    id,
                    availability_zone: "us-east-1a".to_string(),
                    instance_type: "t3.medium".to_string(),
                    resources: Resources::new(2048, 4096),
                    attributes: Default::default(),
                    launched_at: u64::from(*next),
                    protected_from_scale_in: false,
                },
            );
        }
    }

    #[async_trait]
    impl InstanceGroupProvider for FakeGroup {
        async fn list_instances(&self) -> Result<Vec<InstanceDescription>> {
            Ok(self.instances.lock().unwrap().values().cloned().collect())
        }

        async fn scale_to(&self, desired: u32) -> Result<()> {
            self.scale_calls.lock().unwrap().push(desired);
            if *self.frozen.lock().unwrap() {
                return Ok(());
            }
            let current = self.instances.lock().unwrap().len() as u32;
            for _ in current..desired {
                self.launch();
            }
            let mut instances = self.instances.lock().unwrap();
            while instances.len() as u32 > desired {
                let victim = instances
                    .values()
                    .filter(|d| !d.protected_from_scale_in)
                    .min_by_key(|d| d.launched_at)
                    .map(|d| d.id.clone());
                match victim {
                    Some(id) => instances.remove(&id),
                    None => break,
                };
            }
            Ok(())
        }

        async fn protect_from_scale_in(&self, instance_id: &str, protected: bool) -> Result<()> {
            if let Some(d) = self.instances.lock().unwrap().get_mut(instance_id) {
                d.protected_from_scale_in = protected;
            }
            Ok(())
        }
    }

    fn spec() -> CapacityProviderSpec {
        CapacityProviderSpec {
            name: "asg".to_string(),
            instance_type: "t3.medium".to_string(),
            availability_zones: vec!["us-east-1a".to_string()],
            instance_cpu: 2048,
            instance_memory: 4096,
            target_capacity_percent: 100,
            min_step: 1,
            max_step: 10,
            min_size: 1,
            max_size: 10,
            managed_termination_protection: true,
        }
    }

    fn definition() -> TaskDefinition {
        TaskDefinition {
            family: "web".to_string(),
            revision: 1,
            cpu: 2048,
            memory: 4096,
            container_port: None,
        }
    }

    async fn run_on(registry: &ClusterRegistry, instance: &str) {
        let task = registry.create_task("web", &definition()).await;
        let reservation = registry
            .try_reserve(instance, &ReservationRequest::new(task.service.clone(), task.requirements))
            .await
            .unwrap();
        registry.bind_task(&task.id, &reservation).await.unwrap();
    }

    #[tokio::test]
    async fn sync_registers_and_removes() {
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(2));
        let scaler = CapacityScaler::new(spec(), registry.clone(), group.clone());

        let report = scaler.sync_instances().await.unwrap();
        assert_eq!(report.registered, vec!["i-001", "i-002"]);

        group.instances.lock().unwrap().remove("i-001");
        let report = scaler.sync_instances().await.unwrap();
        assert_eq!(report.removed, vec!["i-001"]);
        assert_eq!(registry.instance_ids().await, vec!["i-002"]);
    }

    #[tokio::test]
    async fn removed_instance_stops_its_tasks() {
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(1));
        let scaler = CapacityScaler::new(spec(), registry.clone(), group.clone());
        scaler.sync_instances().await.unwrap();
        run_on(&registry, "i-001").await;

        group.instances.lock().unwrap().clear();
        let report = scaler.sync_instances().await.unwrap();
        assert_eq!(report.orphaned_tasks, 1);
        assert!(registry.active_tasks_for_service("web").await.is_empty());
    }

    #[derive(Default)]
    struct RecordingTargets {
        deregistered: Mutex<Vec<(String, u16)>>,
    }

    #[async_trait]
    impl TargetRegistration for RecordingTargets {
        async fn register_target(&self, _instance_id: &str, _port: u16) -> Result<()> {
            Ok(())
        }

        async fn deregister_target(&self, instance_id: &str, port: u16) -> Result<()> {
            self.deregistered
                .lock()
                .unwrap()
                .push((instance_id.to_string(), port));
            Ok(())
        }
    }

    #[tokio::test]
    async fn removed_instance_deregisters_balanced_targets() {
        let registry = ClusterRegistry::new();
        let mut base = definition();
        base.cpu = 512;
        base.memory = 1024;
        base.container_port = Some(8080);
        for (name, balanced) in [("web", true), ("batch", false)] {
            let mut definition = base.clone();
            definition.family = name.to_string();
            registry
                .put_service(ServiceSpec {
                    name: name.to_string(),
                    task_definition: definition,
                    desired_count: 1,
                    placement_strategies: vec![],
                    placement_constraints: vec![],
                    deployment: DeploymentPolicy::default(),
                    scaling: None,
                    load_balancer: balanced.then_some(LoadBalancerBinding {
                        container_port: 8080,
                    }),
                })
                .await;
        }

        let group = Arc::new(FakeGroup::with_instances(2));
        let targets = Arc::new(RecordingTargets::default());
        let scaler = CapacityScaler::new(spec(), registry.clone(), group.clone())
            .with_targets(targets.clone());
        scaler.sync_instances().await.unwrap();

        let mut web_port = None;
        for name in ["web", "batch"] {
            let service = registry.service(name).await.unwrap();
            let task = registry.create_task(name, &service.task_definition).await;
            let reservation = registry
                .try_reserve("i-001", &ReservationRequest::for_task(&task))
                .await
                .unwrap();
            let bound = registry.bind_task(&task.id, &reservation).await.unwrap();
            if name == "web" {
                web_port = bound.host_port;
            }
        }
        let survivor = registry.create_task("web", &base).await;
        let reservation = registry
            .try_reserve("i-002", &ReservationRequest::for_task(&survivor))
            .await
            .unwrap();
        registry.bind_task(&survivor.id, &reservation).await.unwrap();

        group.instances.lock().unwrap().remove("i-001");
        let report = scaler.sync_instances().await.unwrap();
        assert_eq!(report.orphaned_tasks, 2);

        // Only the balanced task on the lost instance loses its target.
        let port = web_port.unwrap();
        assert_eq!(
            *targets.deregistered.lock().unwrap(),
            vec![("i-001".to_string(), port)]
        );
    }

    #[tokio::test]
    async fn protection_follows_task_presence() {
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(2));
        let scaler = CapacityScaler::new(spec(), registry.clone(), group.clone());
        scaler.sync_instances().await.unwrap();
        run_on(&registry, "i-002").await;

        assert_eq!(scaler.apply_protection().await, 1);
        assert!(registry.instance("i-002").await.unwrap().protected_from_scale_in);
        assert!(group.instances.lock().unwrap()["i-002"].protected_from_scale_in);
        // Already in sync.
        assert_eq!(scaler.apply_protection().await, 0);
    }

    #[tokio::test]
    async fn pending_tasks_trigger_scale_out() {
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(1));
        let mut scaler = CapacityScaler::new(spec(), registry.clone(), group.clone());
        scaler.sync_instances().await.unwrap();
        run_on(&registry, "i-001").await;
        registry.create_task("web", &definition()).await;

        let action = scaler.run_cycle().await.unwrap();
        assert_eq!(action, ScalingAction::ScaleOut(1));
        assert_eq!(*group.scale_calls.lock().unwrap(), vec![2]);

        // The next cycle picks up the new instance.
        scaler.sync_instances().await.unwrap();
        assert_eq!(registry.instance_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn idle_instances_drain_and_leave() {
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(3));
        let mut scaler = CapacityScaler::new(spec(), registry.clone(), group.clone());
        scaler.sync_instances().await.unwrap();
        run_on(&registry, "i-001").await;

        let action = scaler.run_cycle().await.unwrap();
        assert_eq!(
            action,
            ScalingAction::ScaleIn {
                instances: vec!["i-002".to_string(), "i-003".to_string()]
            }
        );
        // Chosen instances stop taking placements straight away.
        assert_eq!(
            registry.instance("i-002").await.unwrap().status,
            InstanceStatus::Draining
        );

        // The protected busy instance survives; the group removed the idle ones.
        scaler.sync_instances().await.unwrap();
        assert_eq!(registry.instance_ids().await, vec!["i-001"]);
    }

    #[tokio::test]
    async fn surviving_draining_instance_returns_to_service() {
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(2));
        let mut scaler = CapacityScaler::new(spec(), registry.clone(), group.clone());
        scaler.sync_instances().await.unwrap();
        registry
            .set_instance_status("i-002", InstanceStatus::Draining)
            .await
            .unwrap();
        scaler.last_target = Some(2);

        scaler.sync_instances().await.unwrap();
        assert_eq!(
            registry.instance("i-002").await.unwrap().status,
            InstanceStatus::InService
        );
    }

    #[tokio::test]
    async fn idle_group_shrinks_to_min_size() {
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(2));
        let mut scaler = CapacityScaler::new(spec(), registry.clone(), group.clone());

        let action = scaler.run_cycle().await.unwrap();
        assert_eq!(
            action,
            ScalingAction::ScaleIn {
                instances: vec!["i-001".to_string()]
            }
        );
        assert_eq!(*group.scale_calls.lock().unwrap(), vec![1]);

        assert_eq!(scaler.run_cycle().await.unwrap(), ScalingAction::NoAction);
        assert_eq!(registry.instance_ids().await, vec!["i-002"]);
    }

    #[tokio::test]
    async fn lagging_scale_in_does_not_cascade() {
        let mut spec = spec();
        spec.managed_termination_protection = false;
        let registry = ClusterRegistry::new();
        let group = Arc::new(FakeGroup::with_instances(4));
        *group.frozen.lock().unwrap() = true;
        let mut scaler = CapacityScaler::new(spec, registry.clone(), group.clone());
        scaler.sync_instances().await.unwrap();
        run_on(&registry, "i-001").await;
        run_on(&registry, "i-002").await;

        assert_eq!(
            scaler.run_cycle().await.unwrap(),
            ScalingAction::ScaleIn {
                instances: vec!["i-003".to_string(), "i-004".to_string()]
            }
        );

        // The group has not terminated anything yet. Draining instances do
        // not count toward the current size, so the busy pair stays put.
        assert_eq!(scaler.run_cycle().await.unwrap(), ScalingAction::NoAction);
        for id in ["i-001", "i-002"] {
            assert_eq!(
                registry.instance(id).await.unwrap().status,
                InstanceStatus::InService
            );
        }

        // Work finishing on i-002 would justify a further scale-in, but not
        // before the previous one lands.
        let task = registry
            .active_tasks_for_service("web")
            .await
            .into_iter()
            .find(|t| t.instance_id.as_deref() == Some("i-002"))
            .unwrap();
        registry.finish_stop(&task.id).await.unwrap();
        assert_eq!(scaler.run_cycle().await.unwrap(), ScalingAction::NoAction);
        assert_eq!(*group.scale_calls.lock().unwrap(), vec![2]);

        {
            let mut instances = group.instances.lock().unwrap();
            instances.remove("i-003");
            instances.remove("i-004");
        }
        assert_eq!(
            scaler.run_cycle().await.unwrap(),
            ScalingAction::ScaleIn {
                instances: vec!["i-002".to_string()]
            }
        );
        assert_eq!(*group.scale_calls.lock().unwrap(), vec![2, 1]);
    }
}
