//! fleetgrid-health — task health checking for FleetGrid.
//!
//! Provides HTTP health probes with thresholds and exponential backoff, a
//! probe-backed [`HealthCheck`](fleetgrid_core::HealthCheck) implementation,
//! and the two consumers of health results: the monitor that records task
//! health in the registry, and the bounded wait used by deployments.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (periodic sweep)
//!   ├── dyn HealthCheck ── HttpHealthCheck
//!   │                        ├── HealthTracker per task (thresholds, backoff)
//!   │                        └── http_probe() → ProbeResult
//!   └── ClusterRegistry::set_task_health
//!
//! wait_until_healthy(check, tasks, timeout, interval)
//! ```
//!
//! A task that has never passed a check stays `Unknown` for a grace period
//! before the monitor reports it `Unhealthy`, so freshly started tasks are
//! not replaced while they boot.

pub mod check;
pub mod checker;
pub mod monitor;
pub mod wait;

pub use check::HttpHealthCheck;
pub use checker::{HealthTracker, ProbeResult, http_probe};
pub use monitor::{HealthMonitor, HealthSweep};
pub use wait::{HealthWaitTimeout, unhealthy_tasks, wait_until_healthy};
