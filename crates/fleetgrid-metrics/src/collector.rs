//! Utilization collector — per-service sliding-window averages.
//!
//! Samples older than the window are dropped on every write and read, so
//! memory stays bounded by the sample rate.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use fleetgrid_core::{MetricType, MetricsSource, ServiceId};

/// Averaging period used when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

type SeriesKey = (ServiceId, MetricType);

pub struct UtilizationCollector {
    window: Duration,
    series: RwLock<HashMap<SeriesKey, VecDeque<(Instant, f64)>>>,
}

impl Default for UtilizationCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl UtilizationCollector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Record a utilization sample (percent) taken now.
    pub async fn record(&self, service: &str, metric: MetricType, percent: f64) {
        if !percent.is_finite() {
            debug!(%service, %metric, percent, "dropping non-finite sample");
            return;
        }
        let now = Instant::now();
        let mut series = self.series.write().await;
        let samples = series
            .entry((service.to_string(), metric))
            .or_default();
        samples.push_back((now, percent));
        prune(samples, now, self.window);
    }

    /// Mean of the samples inside the window, or `None` if there are none.
    pub async fn average(&self, service: &str, metric: MetricType) -> Option<f64> {
        let now = Instant::now();
        let series = self.series.read().await;
        let samples = series.get(&(service.to_string(), metric))?;
        let (sum, count) = samples
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= self.window)
            .fold((0.0, 0u32), |(sum, n), (_, v)| (sum + v, n + 1));
        (count > 0).then(|| sum / f64::from(count))
    }

    /// Drop all samples for a service.
    pub async fn forget(&self, service: &str) {
        self.series
            .write()
            .await
            .retain(|(s, _), _| s != service);
    }
}

fn prune(samples: &mut VecDeque<(Instant, f64)>, now: Instant, window: Duration) {
    while samples
        .front()
        .is_some_and(|(at, _)| now.duration_since(*at) > window)
    {
        samples.pop_front();
    }
}

#[async_trait]
impl MetricsSource for UtilizationCollector {
    async fn get_utilization(&self, service_id: &str, metric: MetricType) -> Result<Option<f64>> {
        Ok(self.average(service_id, metric).await)
    }
}
