//! fleet.toml configuration parser.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration;
use crate::types::*;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse fleet.toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub loops: LoopsConfig,
    pub capacity_provider: CapacityProviderSpec,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
}

/// Cadence of each control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopsConfig {
    #[serde(with = "duration::serde_str", default = "default_service_interval")]
    pub service_interval: Duration,
    #[serde(with = "duration::serde_str", default = "default_autoscale_interval")]
    pub autoscale_interval: Duration,
    #[serde(with = "duration::serde_str", default = "default_capacity_interval")]
    pub capacity_interval: Duration,
    #[serde(with = "duration::serde_str", default = "default_health_interval")]
    pub health_interval: Duration,
    /// How long a task that has never passed a check is left `Unknown`.
    #[serde(with = "duration::serde_str", default = "default_health_grace_period")]
    pub health_grace_period: Duration,
}

fn default_service_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_autoscale_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_capacity_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_grace_period() -> Duration {
    Duration::from_secs(30)
}

impl Default for LoopsConfig {
    fn default() -> Self {
        Self {
            service_interval: default_service_interval(),
            autoscale_interval: default_autoscale_interval(),
            capacity_interval: default_capacity_interval(),
            health_interval: default_health_interval(),
            health_grace_period: default_health_grace_period(),
        }
    }
}

/// Knobs for the in-process simulated instance group used by `fleetd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Instances launched before the first capacity pass.
    #[serde(default = "default_initial_instances")]
    pub initial_instances: u32,
    /// Time a placed task takes to pass its first health check.
    #[serde(with = "duration::serde_str", default = "default_startup_delay")]
    pub startup_delay: Duration,
    /// Offered load per service, in "fully busy tasks". Utilization is
    /// `load / running_tasks * 100`.
    #[serde(default)]
    pub service_load: HashMap<ServiceId, f64>,
}

fn default_initial_instances() -> u32 {
    1
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(2)
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_instances: default_initial_instances(),
            startup_delay: default_startup_delay(),
            service_load: HashMap::new(),
        }
    }
}

impl FleetConfig {
    /// Read, parse, and validate a fleet.toml file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cp = &self.capacity_provider;
        if !(1..=100).contains(&cp.target_capacity_percent) {
            return Err(invalid(
                "capacity_provider.target_capacity_percent",
                "must be between 1 and 100",
            ));
        }
        if cp.min_step == 0 {
            return Err(invalid("capacity_provider.min_step", "must be at least 1"));
        }
        if cp.min_step > cp.max_step {
            return Err(invalid(
                "capacity_provider.max_step",
                "must not be smaller than min_step",
            ));
        }
        if cp.min_size > cp.max_size {
            return Err(invalid(
                "capacity_provider.max_size",
                "must not be smaller than min_size",
            ));
        }
        if cp.instance_resources().is_zero() {
            return Err(invalid(
                "capacity_provider.instance_cpu",
                "instance template has no capacity",
            ));
        }

        let mut seen = HashSet::new();
        for (i, svc) in self.services.iter().enumerate() {
            let prefix = format!("service[{i}]");
            if !seen.insert(svc.name.as_str()) {
                return Err(invalid(
                    format!("{prefix}.name"),
                    format!("duplicate service {:?}", svc.name),
                ));
            }
            let req = svc.task_definition.requirements();
            if req.is_zero() {
                return Err(invalid(
                    format!("{prefix}.task_definition"),
                    "cpu and memory cannot both be zero",
                ));
            }
            if !req.fits_within(&cp.instance_resources()) {
                return Err(invalid(
                    format!("{prefix}.task_definition"),
                    format!(
                        "requires {req}, more than one {} instance provides",
                        cp.instance_type
                    ),
                ));
            }
            let dep = &svc.deployment;
            if dep.minimum_healthy_percent > 100 {
                return Err(invalid(
                    format!("{prefix}.deployment.minimum_healthy_percent"),
                    "must be at most 100",
                ));
            }
            if dep.maximum_percent < 100 {
                return Err(invalid(
                    format!("{prefix}.deployment.maximum_percent"),
                    "must be at least 100",
                ));
            }
            if let Some(policy) = &svc.scaling {
                if !(policy.target_value > 0.0 && policy.target_value.is_finite()) {
                    return Err(invalid(
                        format!("{prefix}.scaling.target_value"),
                        "must be a positive number",
                    ));
                }
                if policy.min_capacity > policy.max_capacity {
                    return Err(invalid(
                        format!("{prefix}.scaling.max_capacity"),
                        "must not be smaller than min_capacity",
                    ));
                }
                if !(0.0..1.0).contains(&policy.tolerance) {
                    return Err(invalid(
                        format!("{prefix}.scaling.tolerance"),
                        "must be in [0, 1)",
                    ));
                }
            }
        }
        Ok(())
    }

    /// A minimal single-service configuration.
    pub fn scaffold(cluster: &str) -> Self {
        FleetConfig {
            cluster: ClusterConfig {
                name: cluster.to_string(),
            },
            loops: LoopsConfig::default(),
            capacity_provider: CapacityProviderSpec {
                name: format!("{cluster}-asg"),
                instance_type: "t3.medium".to_string(),
                availability_zones: vec!["us-east-1a".to_string(), "us-east-1b".to_string()],
                instance_cpu: 2048,
                instance_memory: 3800,
                target_capacity_percent: 100,
                min_step: 1,
                max_step: 4,
                min_size: 1,
                max_size: 10,
                managed_termination_protection: true,
            },
            services: vec![ServiceSpec {
                name: "web".to_string(),
                task_definition: TaskDefinition {
                    family: "web".to_string(),
                    revision: 1,
                    cpu: 256,
                    memory: 512,
                    container_port: Some(80),
                },
                desired_count: 2,
                placement_strategies: vec![
                    PlacementStrategy::Spread {
                        field: PlacementField::AvailabilityZone,
                    },
                    PlacementStrategy::Binpack {
                        resource: ResourceKind::Memory,
                    },
                ],
                placement_constraints: Vec::new(),
                deployment: DeploymentPolicy::default(),
                scaling: None,
                load_balancer: Some(LoadBalancerBinding { container_port: 80 }),
            }],
            simulation: SimulationConfig::default(),
        }
    }
}
