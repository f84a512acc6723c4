//! fleetgrid-scheduler — service task reconciliation.
//!
//! Keeps every service at its desired task count. The scheduler:
//!
//! - Creates PENDING tasks and places them through the placement engine
//! - Retries placement of tasks left PENDING for lack of capacity
//! - Replaces tasks the health monitor marked unhealthy
//! - Stops excess tasks when the desired count drops
//! - Registers and deregisters task targets with the load balancer
//!
//! # Architecture
//!
//! ```text
//! ServiceScheduler
//!   ├── ClusterRegistry (services, tasks, deployment markers)
//!   ├── PlacementEngine (reserve + bind)
//!   ├── dyn TargetRegistration (load balancer)
//!   └── Optional StateStore (snapshot after each pass)
//! ```

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{PlaceOutcome, ReconcileSummary, ServiceScheduler};
