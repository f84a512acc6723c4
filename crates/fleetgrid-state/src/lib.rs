//! fleetgrid-state — cluster registry and snapshot store for FleetGrid.
//!
//! # Architecture
//!
//! [`ClusterRegistry`] is the live, in-memory view of instances, tasks, and
//! services that every control loop reads and mutates. Each instance record
//! has its own lock; resource reservation is the single critical section
//! that guarantees no instance is ever overcommitted.
//!
//! [`StateStore`] is backed by [redb](https://docs.rs/redb) and persists
//! [`RegistrySnapshot`]s so `fleetd` can resume after a restart. Records are
//! JSON-serialized into redb's `&[u8]` value columns, keyed by id.
//!
//! Both types are `Clone` + `Send` + `Sync` and can be shared across async
//! tasks.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, StateError, StateResult};
pub use registry::{ClusterRegistry, Reservation, ReservationRequest, ServicePass};
pub use store::StateStore;
pub use types::*;
