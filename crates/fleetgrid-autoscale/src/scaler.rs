//! ServiceScaler — metrics-driven desired-count adjustment.
//!
//! [`target_count`] is the pure target-tracking rule. [`ServiceScaler`]
//! adds per-service cooldown tracking, polls the metrics source, and
//! writes decisions to the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetgrid_core::{MetricsSource, ServiceId, TargetTrackingPolicy};
use fleetgrid_state::ClusterRegistry;

/// Absorbs float noise so `ceil(4 * 0.5)` stays 2.
const CEIL_EPSILON: f64 = 1e-9;

/// A scaling decision for a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Set the desired count to this value.
    ScaleTo(u32),
    NoChange,
}

/// Target-tracking rule: `ceil(current * observed / target)` clamped to the
/// policy's capacity bounds, with no action inside the tolerance band.
pub fn target_count(observed: f64, policy: &TargetTrackingPolicy, current: u32) -> ScaleDecision {
    if !observed.is_finite() || observed < 0.0 {
        warn!(observed, "ignoring invalid utilization");
        return ScaleDecision::NoChange;
    }
    if !(policy.target_value > 0.0 && policy.target_value.is_finite()) {
        warn!(target = policy.target_value, "ignoring non-positive scaling target");
        return ScaleDecision::NoChange;
    }

    let (min, max) = (policy.min_capacity, policy.max_capacity.max(policy.min_capacity));
    let clamp = |n: u32| n.clamp(min, max);

    if current == 0 {
        let desired = if observed > 0.0 { clamp(min.max(1)) } else { min };
        return change(current, desired);
    }

    let ratio = observed / policy.target_value;
    if (ratio - 1.0).abs() <= policy.tolerance {
        // Inside the band, only enforce the bounds.
        return change(current, clamp(current));
    }

    let raw = (f64::from(current) * ratio - CEIL_EPSILON).ceil();
    let desired = if raw >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        raw.max(0.0) as u32
    };
    change(current, clamp(desired))
}

fn change(current: u32, desired: u32) -> ScaleDecision {
    if desired == current {
        ScaleDecision::NoChange
    } else {
        ScaleDecision::ScaleTo(desired)
    }
}

/// Last action times for one service.
#[derive(Debug, Default)]
struct Cooldowns {
    last_scale_out: Option<Instant>,
    last_scale_in: Option<Instant>,
}

/// Evaluates target-tracking policies and updates desired counts.
pub struct ServiceScaler {
    registry: ClusterRegistry,
    metrics: Arc<dyn MetricsSource>,
    cooldowns: HashMap<ServiceId, Cooldowns>,
}

impl ServiceScaler {
    pub fn new(registry: ClusterRegistry, metrics: Arc<dyn MetricsSource>) -> Self {
        Self {
            registry,
            metrics,
            cooldowns: HashMap::new(),
        }
    }

    /// Apply the rule and the service's cooldown windows at time `now`.
    pub fn decide(
        &mut self,
        service: &str,
        policy: &TargetTrackingPolicy,
        observed: f64,
        current: u32,
        now: Instant,
    ) -> ScaleDecision {
        let decision = target_count(observed, policy, current);
        let ScaleDecision::ScaleTo(desired) = decision else {
            return decision;
        };

        let cooldowns = self.cooldowns.entry(service.to_string()).or_default();
        let (last, window, direction) = if desired > current {
            (&mut cooldowns.last_scale_out, policy.scale_out_cooldown, "out")
        } else {
            (&mut cooldowns.last_scale_in, policy.scale_in_cooldown, "in")
        };

        if let Some(at) = *last {
            let elapsed = now.saturating_duration_since(at);
            if elapsed < window {
                debug!(
                    %service,
                    direction,
                    remaining_ms = (window - elapsed).as_millis() as u64,
                    "scaling suppressed by cooldown"
                );
                return ScaleDecision::NoChange;
            }
        }
        *last = Some(now);
        decision
    }

    /// Poll metrics for every service with a policy and write new desired
    /// counts to the registry.
    pub async fn evaluate_all(&mut self) -> Vec<(ServiceId, ScaleDecision)> {
        let mut decisions = Vec::new();

        for spec in self.registry.services().await {
            let Some(policy) = spec.scaling.as_ref() else {
                continue;
            };

            let observed = match self.metrics.get_utilization(&spec.name, policy.metric).await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    debug!(service = %spec.name, metric = %policy.metric, "no datapoints yet");
                    continue;
                }
                Err(e) => {
                    warn!(service = %spec.name, error = %e, "metrics query failed");
                    continue;
                }
            };

            let decision = self.decide(
                &spec.name,
                policy,
                observed,
                spec.desired_count,
                Instant::now(),
            );

            if let ScaleDecision::ScaleTo(desired) = decision {
                match self.registry.set_desired_count(&spec.name, desired).await {
                    Ok(previous) => info!(
                        service = %spec.name,
                        from = previous,
                        to = desired,
                        metric = %policy.metric,
                        observed,
                        target = policy.target_value,
                        "service scaled"
                    ),
                    Err(e) => warn!(service = %spec.name, error = %e, "failed to set desired count"),
                }
            }
            decisions.push((spec.name.clone(), decision));
        }

        decisions
    }

    /// Evaluate on every tick until `shutdown` flips to true.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "service scaler started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("service scaler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use fleetgrid_core::{DeploymentPolicy, MetricType, ServiceSpec, TaskDefinition};

    fn policy(target: f64, min: u32, max: u32) -> TargetTrackingPolicy {
        TargetTrackingPolicy {
            metric: MetricType::CpuUtilization,
            target_value: target,
            min_capacity: min,
            max_capacity: max,
            scale_out_cooldown: Duration::from_secs(60),
            scale_in_cooldown: Duration::from_secs(300),
            tolerance: 0.1,
        }
    }

    #[test]
    fn doubles_when_metric_is_twice_target() {
        assert_eq!(target_count(160.0, &policy(80.0, 1, 10), 4), ScaleDecision::ScaleTo(8));
    }

    #[test]
    fn scale_out_capped_at_max_capacity() {
        assert_eq!(target_count(160.0, &policy(80.0, 1, 6), 4), ScaleDecision::ScaleTo(6));
    }

    #[test]
    fn scale_in_floored_at_min_capacity() {
        assert_eq!(target_count(40.0, &policy(80.0, 1, 10), 4), ScaleDecision::ScaleTo(2));
        assert_eq!(target_count(10.0, &policy(80.0, 3, 10), 4), ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn tolerance_band_is_idempotent() {
        let p = policy(80.0, 1, 10);
        for observed in [72.5, 80.0, 87.9] {
            assert_eq!(target_count(observed, &p, 4), ScaleDecision::NoChange);
        }
        // Repeated calls with an unchanged metric stay put.
        assert_eq!(target_count(84.0, &p, 4), target_count(84.0, &p, 4));
    }

    #[test]
    fn band_still_enforces_bounds() {
        assert_eq!(target_count(80.0, &policy(80.0, 5, 10), 4), ScaleDecision::ScaleTo(5));
    }

    #[test]
    fn zero_current_with_load_starts_one() {
        assert_eq!(target_count(50.0, &policy(80.0, 0, 10), 0), ScaleDecision::ScaleTo(1));
        assert_eq!(target_count(50.0, &policy(80.0, 2, 10), 0), ScaleDecision::ScaleTo(2));
        assert_eq!(target_count(0.0, &policy(80.0, 0, 10), 0), ScaleDecision::NoChange);
    }

    #[test]
    fn invalid_inputs_yield_no_change() {
        assert_eq!(target_count(f64::NAN, &policy(80.0, 1, 10), 4), ScaleDecision::NoChange);
        assert_eq!(target_count(90.0, &policy(0.0, 1, 10), 4), ScaleDecision::NoChange);
        assert_eq!(target_count(-5.0, &policy(80.0, 1, 10), 4), ScaleDecision::NoChange);
    }

    struct FixedMetrics(Mutex<Option<f64>>);

    #[async_trait]
    impl MetricsSource for FixedMetrics {
        async fn get_utilization(&self, _service: &str, _metric: MetricType) -> anyhow::Result<Option<f64>> {
            Ok(*self.0.lock().unwrap())
        }
    }

    fn scaler() -> ServiceScaler {
        ServiceScaler::new(ClusterRegistry::new(), Arc::new(FixedMetrics(Mutex::new(None))))
    }

    #[test]
    fn scale_out_cooldown_blocks_repeat_scale_out() {
        let mut s = scaler();
        let p = policy(50.0, 1, 100);
        let t0 = Instant::now();

        assert_eq!(s.decide("web", &p, 100.0, 2, t0), ScaleDecision::ScaleTo(4));
        assert_eq!(
            s.decide("web", &p, 100.0, 4, t0 + Duration::from_secs(30)),
            ScaleDecision::NoChange
        );
        assert_eq!(
            s.decide("web", &p, 100.0, 4, t0 + Duration::from_secs(61)),
            ScaleDecision::ScaleTo(8)
        );
    }

    #[test]
    fn scale_out_interrupts_scale_in_cooldown() {
        let mut s = scaler();
        let p = policy(50.0, 1, 100);
        let t0 = Instant::now();

        assert_eq!(s.decide("web", &p, 10.0, 10, t0), ScaleDecision::ScaleTo(2));
        // Another scale-in inside the window is suppressed...
        assert_eq!(
            s.decide("web", &p, 10.0, 2, t0 + Duration::from_secs(10)),
            ScaleDecision::NoChange
        );
        // ...but a scale-out is not.
        assert_eq!(
            s.decide("web", &p, 100.0, 2, t0 + Duration::from_secs(10)),
            ScaleDecision::ScaleTo(4)
        );
    }

    #[test]
    fn cooldowns_are_per_service() {
        let mut s = scaler();
        let p = policy(50.0, 1, 100);
        let t0 = Instant::now();
        assert_eq!(s.decide("web", &p, 100.0, 2, t0), ScaleDecision::ScaleTo(4));
        assert_eq!(s.decide("api", &p, 100.0, 2, t0), ScaleDecision::ScaleTo(4));
    }

    #[tokio::test]
    async fn evaluate_all_writes_desired_count() {
        let registry = ClusterRegistry::new();
        registry
            .put_service(ServiceSpec {
                name: "web".to_string(),
                task_definition: TaskDefinition {
                    family: "web".to_string(),
                    revision: 1,
                    cpu: 256,
                    memory: 512,
                    container_port: None,
                },
                desired_count: 4,
                placement_strategies: vec![],
                placement_constraints: vec![],
                deployment: DeploymentPolicy::default(),
                scaling: Some(policy(80.0, 1, 10)),
                load_balancer: None,
            })
            .await;
        let metrics = Arc::new(FixedMetrics(Mutex::new(None)));
        let mut s = ServiceScaler::new(registry.clone(), metrics.clone());

        // No datapoints: nothing happens.
        assert!(s.evaluate_all().await.is_empty());

        *metrics.0.lock().unwrap() = Some(160.0);
        let decisions = s.evaluate_all().await;
        assert_eq!(decisions, vec![("web".to_string(), ScaleDecision::ScaleTo(8))]);
        assert_eq!(registry.service("web").await.unwrap().desired_count, 8);

        // Same metric, now inside the cooldown.
        let decisions = s.evaluate_all().await;
        assert_eq!(decisions, vec![("web".to_string(), ScaleDecision::NoChange)]);
    }
}
