//! StateStore — redb-backed persistence for registry snapshots.
//!
//! Provides typed CRUD over instances, tasks, and services plus whole
//! snapshot save/load. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use fleetgrid_core::ServiceSpec;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        self.put(INSTANCES, &record.id, record)
    }

    pub fn get_instance(&self, id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, id)
    }

    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.list(INSTANCES)
    }

    /// Delete an instance by id. Returns true if it existed.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        self.delete(INSTANCES, id)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        self.put(TASKS, &task.id, task)
    }

    pub fn get_task(&self, id: &str) -> StateResult<Option<TaskRecord>> {
        self.get(TASKS, id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.list(TASKS)
    }

    /// List all tasks belonging to one service.
    pub fn list_tasks_for_service(&self, service: &str) -> StateResult<Vec<TaskRecord>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.service == service)
            .collect())
    }

    pub fn delete_task(&self, id: &str) -> StateResult<bool> {
        self.delete(TASKS, id)
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn put_service(&self, spec: &ServiceSpec) -> StateResult<()> {
        self.put(SERVICES, &spec.name, spec)
    }

    pub fn get_service(&self, name: &str) -> StateResult<Option<ServiceSpec>> {
        self.get(SERVICES, name)
    }

    pub fn list_services(&self) -> StateResult<Vec<ServiceSpec>> {
        self.list(SERVICES)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Replace the stored state with `snapshot` in a single transaction.
    pub fn save_snapshot(&self, snapshot: &RegistrySnapshot) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table.retain(|_, _| false).map_err(map_err!(Write))?;
            for record in &snapshot.instances {
                let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                table
                    .insert(record.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table.retain(|_, _| false).map_err(map_err!(Write))?;
            for task in &snapshot.tasks {
                let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
                table
                    .insert(task.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table.retain(|_, _| false).map_err(map_err!(Write))?;
            for spec in &snapshot.services {
                let value = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
                table
                    .insert(spec.name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            instances = snapshot.instances.len(),
            tasks = snapshot.tasks.len(),
            services = snapshot.services.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Read back everything stored, ordered by key.
    pub fn load_snapshot(&self) -> StateResult<RegistrySnapshot> {
        Ok(RegistrySnapshot {
            instances: self.list_instances()?,
            tasks: self.list_tasks()?,
            services: self.list_services()?,
        })
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn put<T: Serialize>(&self, def: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, def: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete(&self, def: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "record deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    use fleetgrid_core::{DeploymentPolicy, Resources, TaskDefinition};

    fn test_instance(id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            availability_zone: "us-east-1a".to_string(),
            instance_type: "m5.large".to_string(),
            attributes: HashMap::from([("ecs.os-type".to_string(), "linux".to_string())]),
            total: Resources::new(2048, 8192),
            available: Resources::new(1792, 7680),
            status: InstanceStatus::InService,
            protected_from_scale_in: true,
            launched_at: 1000,
            reserved_ports: BTreeSet::from([32768]),
            service_tasks: BTreeMap::from([("web".to_string(), 1)]),
        }
    }

    fn test_task(id: &str, service: &str, sequence: u64) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            service: service.to_string(),
            task_definition: format!("{service}:1"),
            revision: 1,
            requirements: Resources::new(256, 512),
            container_port: Some(8080),
            instance_id: Some("i-1".to_string()),
            host_port: Some(32768),
            state: TaskState::Running,
            health: HealthStatus::Healthy,
            sequence,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_service(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            task_definition: TaskDefinition {
                family: name.to_string(),
                revision: 1,
                cpu: 256,
                memory: 512,
                container_port: Some(8080),
            },
            desired_count: 3,
            placement_strategies: vec![],
            placement_constraints: vec![],
            deployment: DeploymentPolicy::default(),
            scaling: None,
            load_balancer: None,
        }
    }

    #[test]
    fn instance_put_get_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("i-1");
        store.put_instance(&inst).unwrap();
        assert_eq!(store.get_instance("i-1").unwrap(), Some(inst));
        assert!(store.delete_instance("i-1").unwrap());
        assert!(!store.delete_instance("i-1").unwrap());
        assert!(store.get_instance("i-1").unwrap().is_none());
    }

    #[test]
    fn tasks_filter_by_service() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_task(&test_task("web-000000", "web", 0)).unwrap();
        store.put_task(&test_task("api-000001", "api", 1)).unwrap();
        store.put_task(&test_task("web-000002", "web", 2)).unwrap();

        let web = store.list_tasks_for_service("web").unwrap();
        assert_eq!(web.len(), 2);
        assert!(web.iter().all(|t| t.service == "web"));
        assert_eq!(store.list_tasks().unwrap().len(), 3);
    }

    #[test]
    fn service_round_trips_durations() {
        let store = StateStore::open_in_memory().unwrap();
        let svc = test_service("web");
        store.put_service(&svc).unwrap();
        let loaded = store.get_service("web").unwrap().unwrap();
        assert_eq!(loaded, svc);
    }

    #[test]
    fn save_snapshot_replaces_previous_contents() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i-stale")).unwrap();
        store.put_task(&test_task("old-000000", "old", 0)).unwrap();

        let snapshot = RegistrySnapshot {
            instances: vec![test_instance("i-1"), test_instance("i-2")],
            tasks: vec![test_task("web-000001", "web", 1)],
            services: vec![test_service("web")],
        };
        store.save_snapshot(&snapshot).unwrap();

        let loaded = store.load_snapshot().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(store.get_instance("i-stale").unwrap().is_none());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        let snapshot = RegistrySnapshot {
            instances: vec![test_instance("i-1")],
            tasks: vec![test_task("web-000000", "web", 0)],
            services: vec![test_service("web")],
        };
        {
            let store = StateStore::open(&path).unwrap();
            store.save_snapshot(&snapshot).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), snapshot);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(store.list_services().unwrap().is_empty());
        assert!(store.get_task("missing").unwrap().is_none());
        assert_eq!(store.load_snapshot().unwrap(), RegistrySnapshot::default());
    }
}
