//! FleetGrid task placement — spread, binpack, constraints.
//!
//! This crate decides which instance hosts a task. It does NOT create or
//! stop tasks (that's `fleetgrid-scheduler`). Instead, it filters and
//! orders candidate instances and reserves capacity on the winner.
//!
//! # Components
//!
//! - **`constraint`** — Hard filters (`distinct-instance`, `member-of`)
//! - **`strategy`** — Narrowing passes (`spread`, `binpack`)
//! - **`placer`** — Pure placement decision over a snapshot of instances
//! - **`engine`** — Registry-backed placement with reservation and retry

pub mod constraint;
pub mod engine;
pub mod error;
pub mod placer;
pub mod strategy;

pub use engine::{BackoffPolicy, PlacementEngine};
pub use error::{FailureReason, PlacementError, PlacementFailure};
pub use placer::{PlacementContext, PlacementRequest, place};
