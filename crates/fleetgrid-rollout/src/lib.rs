//! FleetGrid rolling deployments — batched replacement with health gates.
//!
//! A deployment replaces a service's tasks with tasks of a new task
//! definition in batches. Each batch stops as many old tasks as the
//! minimum-healthy floor allows, starts as many new tasks as the
//! maximum-percent ceiling allows, and waits for the new tasks to pass
//! their health checks before the next batch is planned.
//!
//! # Components
//!
//! - **`planner`** — Batch sizing from the deployment policy
//! - **`controller`** — Deployment state machine, handle, and event stream
//! - **`error`** — Why a deployment failed

pub mod controller;
pub mod error;
pub mod planner;

pub use controller::{DeploymentController, DeploymentEvent, DeploymentHandle, DeploymentPhase};
pub use error::{DeploymentFailure, DeploymentProgress};
pub use planner::{BatchBounds, BatchPlan, TaskCounts, bounds, plan_batch, validate};
