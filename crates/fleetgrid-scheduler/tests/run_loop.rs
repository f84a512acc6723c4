//! The scheduler loop converges services and persists snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use fleetgrid_core::{
    DeploymentPolicy, InstanceDescription, Resources, ServiceSpec, TargetRegistration,
    TaskDefinition,
};
use fleetgrid_placement::PlacementEngine;
use fleetgrid_scheduler::ServiceScheduler;
use fleetgrid_state::{ClusterRegistry, InstanceRecord, StateStore, TaskState};

struct NoBalancer;

#[async_trait]
impl TargetRegistration for NoBalancer {
    async fn register_target(&self, _instance_id: &str, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deregister_target(&self, _instance_id: &str, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }
}

fn service(name: &str, desired: u32) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        task_definition: TaskDefinition {
            family: name.to_string(),
            revision: 1,
            cpu: 256,
            memory: 256,
            container_port: None,
        },
        desired_count: desired,
        placement_strategies: vec![],
        placement_constraints: vec![],
        deployment: DeploymentPolicy::default(),
        scaling: None,
        load_balancer: None,
    }
}

#[tokio::test]
async fn run_converges_and_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.redb");

    {
        let registry = ClusterRegistry::new();
        registry
            .register_instance(InstanceRecord::from_description(&InstanceDescription {
                id: "i-1".to_string(),
                availability_zone: "az-a".to_string(),
                instance_type: "m5.large".to_string(),
                resources: Resources::new(4096, 4096),
                attributes: HashMap::new(),
                launched_at: 0,
                protected_from_scale_in: false,
            }))
            .await;
        registry.put_service(service("web", 3)).await;
        registry.put_service(service("worker", 2)).await;

        let store = StateStore::open(&path).unwrap();
        let scheduler = Arc::new(
            ServiceScheduler::new(PlacementEngine::new(registry.clone()), Arc::new(NoBalancer))
                .with_store(store),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(Duration::from_millis(20), rx).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let running = registry
                    .tasks()
                    .await
                    .iter()
                    .filter(|t| t.state == TaskState::Running)
                    .count();
                if running == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Let one more pass persist the converged state.
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    let snapshot = store.load_snapshot().unwrap();
    assert_eq!(snapshot.services.len(), 2);
    assert_eq!(snapshot.tasks.len(), 5);

    let restored = ClusterRegistry::new();
    restored.restore(snapshot).await;
    assert_eq!(restored.active_tasks_for_service("web").await.len(), 3);
    assert_eq!(
        restored.instance("i-1").await.unwrap().available,
        Resources::new(4096 - 5 * 256, 4096 - 5 * 256)
    );
}
