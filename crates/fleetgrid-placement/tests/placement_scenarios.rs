//! Registry-backed placement scenarios.

use std::collections::{BTreeSet, HashMap};

use fleetgrid_core::{
    DeploymentPolicy, InstanceDescription, PlacementConstraint, PlacementField,
    PlacementStrategy, ResourceKind, Resources, ServiceSpec, TaskDefinition,
};
use fleetgrid_placement::PlacementEngine;
use fleetgrid_state::{ClusterRegistry, InstanceRecord};

fn service(name: &str, memory: u32, strategies: Vec<PlacementStrategy>) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        task_definition: TaskDefinition {
            family: name.to_string(),
            revision: 1,
            cpu: 256,
            memory,
            container_port: Some(8080),
        },
        desired_count: 4,
        placement_strategies: strategies,
        placement_constraints: vec![],
        deployment: DeploymentPolicy::default(),
        scaling: None,
        load_balancer: None,
    }
}

async fn register(registry: &ClusterRegistry, id: &str, zone: &str, memory: u32) {
    registry
        .register_instance(InstanceRecord::from_description(&InstanceDescription {
            id: id.to_string(),
            availability_zone: zone.to_string(),
            instance_type: "m5.large".to_string(),
            resources: Resources::new(2048, memory),
            attributes: HashMap::new(),
            launched_at: 0,
            protected_from_scale_in: false,
        }))
        .await;
}

#[tokio::test]
async fn spread_across_zones_then_binpack_memory() {
    let registry = ClusterRegistry::new();
    register(&registry, "i-a1", "us-east-1a", 8192).await;
    register(&registry, "i-a2", "us-east-1a", 2048).await;
    register(&registry, "i-b1", "us-east-1b", 4096).await;
    register(&registry, "i-b2", "us-east-1b", 1024).await;

    let svc = service(
        "web",
        512,
        vec![
            PlacementStrategy::Spread {
                field: PlacementField::AvailabilityZone,
            },
            PlacementStrategy::Binpack {
                resource: ResourceKind::Memory,
            },
        ],
    );
    let engine = PlacementEngine::new(registry.clone());

    for _ in 0..4 {
        let task = registry.create_task(&svc.name, &svc.task_definition).await;
        engine.place_task(&task, &svc).await.unwrap();
    }

    let counts = registry.placed_counts_for_service("web").await;
    let zone_a = counts.get("i-a1").copied().unwrap_or(0) + counts.get("i-a2").copied().unwrap_or(0);
    let zone_b = counts.get("i-b1").copied().unwrap_or(0) + counts.get("i-b2").copied().unwrap_or(0);
    assert_eq!((zone_a, zone_b), (2, 2));

    // Least-free instance in each zone takes both of that zone's tasks.
    assert_eq!(counts.get("i-a2"), Some(&2));
    assert_eq!(counts.get("i-b2"), Some(&2));
    assert!(!counts.contains_key("i-a1"));
    assert!(!counts.contains_key("i-b1"));

    let b2 = registry.instance("i-b2").await.unwrap();
    assert_eq!(b2.available.memory, 0);
    assert_eq!(b2.reserved_ports.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_placements_never_overcommit() {
    let registry = ClusterRegistry::new();
    register(&registry, "i-1", "us-east-1a", 2048).await;
    register(&registry, "i-2", "us-east-1b", 2048).await;

    let svc = service(
        "api",
        512,
        vec![PlacementStrategy::Binpack {
            resource: ResourceKind::Memory,
        }],
    );
    let engine = PlacementEngine::new(registry.clone());

    let mut handles = Vec::new();
    for _ in 0..12 {
        let registry = registry.clone();
        let engine = engine.clone();
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            let task = registry.create_task(&svc.name, &svc.task_definition).await;
            engine.place_task(&task, &svc).await.is_ok()
        }));
    }

    let mut placed = 0;
    for h in handles {
        if h.await.unwrap() {
            placed += 1;
        }
    }

    // 2 instances × 4 slots; contention may defer some, but never overcommit.
    assert!(placed <= 8);
    let mut reserved = 0;
    for instance in registry.instances().await {
        let used = instance.total.checked_sub(&instance.available).unwrap();
        assert!(used.memory <= instance.total.memory);
        assert_eq!(used.memory, 512 * instance.reserved_ports.len() as u32);
        reserved += instance.reserved_ports.len();
    }
    assert_eq!(reserved, placed);
    assert_eq!(
        registry.active_tasks_by_instance().await.values().sum::<u32>() as usize,
        placed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_distinct_placements_never_share_an_instance() {
    let mut svc = service(
        "worker",
        256,
        vec![PlacementStrategy::Binpack {
            resource: ResourceKind::Memory,
        }],
    );
    svc.placement_constraints = vec![PlacementConstraint::DistinctInstance];

    for _ in 0..25 {
        let registry = ClusterRegistry::new();
        for id in ["i-1", "i-2", "i-3", "i-4"] {
            register(&registry, id, "us-east-1a", 8192).await;
        }
        let engine = PlacementEngine::new(registry.clone());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let engine = engine.clone();
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                let task = registry.create_task(&svc.name, &svc.task_definition).await;
                engine.place_task(&task, &svc).await.ok()
            }));
        }

        let mut hosts = Vec::new();
        for h in handles {
            if let Some(placed) = h.await.unwrap() {
                hosts.push(placed.instance_id.unwrap());
            }
        }
        let distinct: BTreeSet<_> = hosts.iter().cloned().collect();
        assert_eq!(distinct.len(), hosts.len(), "shared host in {hosts:?}");

        for instance in registry.instances().await {
            assert!(instance.tasks_of("worker") <= 1);
        }
    }
}
