//! fleetgrid-autoscale — target-tracking service scaling.
//!
//! Polls each service's utilization from the metrics source, compares it
//! against the policy's target, and writes a new desired task count to the
//! registry. The scheduler then converges the service on that count.
//!
//! # Scaling Algorithm
//!
//! ```text
//! ratio = observed / target
//!
//! if |ratio - 1| <= tolerance:
//!     NoChange                          // hysteresis band
//!
//! desired = ceil(current * ratio)
//! ScaleTo(clamp(desired, min_capacity, max_capacity))
//!
//! if current == 0 and observed > 0:
//!     ScaleTo(max(min_capacity, 1))
//! ```
//!
//! Separate cooldown windows (`scale_out_cooldown`, `scale_in_cooldown`)
//! are measured from the last action in each direction. A scale-out may
//! interrupt a scale-in cooldown.

pub mod scaler;

pub use scaler::{ScaleDecision, ServiceScaler, target_count};
