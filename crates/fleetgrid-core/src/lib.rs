pub mod config;
pub mod duration;
pub mod provider;
pub mod types;

pub use config::{ConfigError, FleetConfig};
pub use duration::{format_duration, parse_duration};
pub use provider::{HealthCheck, InstanceGroupProvider, MetricsSource, TargetRegistration};
pub use types::*;
