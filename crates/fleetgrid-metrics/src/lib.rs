//! fleetgrid-metrics — service utilization for FleetGrid.
//!
//! [`UtilizationCollector`] receives CPU and memory utilization samples per
//! service and serves them back as the averaged
//! [`MetricsSource`](fleetgrid_core::MetricsSource) the service scaler
//! polls.

pub mod collector;

pub use collector::{DEFAULT_WINDOW, UtilizationCollector};
