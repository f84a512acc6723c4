//! fleetgrid-capacity: capacity-provider managed scaling.
//!
//! Each cycle the [`CapacityScaler`] syncs the registry with the instance
//! group, refreshes scale-in protection, and sizes the group so that busy
//! instances plus the instances the pending backlog needs make up
//! `target_capacity_percent` of it:
//!
//! ```text
//! required = busy + extra_for_pending
//! target   = clamp(ceil(required * 100 / target_capacity_percent), min_size, max_size)
//! ```
//!
//! Step sizes are clamped to `[min_step, max_step]`. Scale-in never picks an
//! instance that is both protected and running tasks.

pub mod reconcile;
pub mod scaler;

pub use reconcile::{ClusterUtilization, InstanceUsage, ScalingAction, reconcile, scale_in_candidates};
pub use scaler::{CapacityScaler, SyncReport};
