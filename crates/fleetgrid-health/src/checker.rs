//! HTTP probes against task endpoints and the per-task verdict they feed.
//!
//! A task's verdict only changes after a run of identical outcomes: a
//! failing run must reach the unhealthy threshold, a passing run the
//! recovery threshold. Probe spacing doubles with each consecutive failure.

use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use fleetgrid_state::HealthStatus;

/// Consecutive failures before a task is reported unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Longest gap between probes of a failing task.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx response.
    Healthy,
    /// Any other response.
    Unhealthy,
    /// No response: refused, broken, or timed out.
    Failed,
}

impl ProbeResult {
    fn passed(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Run of identical outcomes ending at the latest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Streak {
    Passing(u32),
    Failing(u32),
}

/// Verdict for one task, driven by its probe history.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    streak: Streak,
    fail_after: u32,
    recover_after: u32,
    interval: Duration,
}

impl HealthTracker {
    /// A tracker that recovers on a single success.
    pub fn new(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self::with_thresholds(unhealthy_threshold, 1, interval)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32, interval: Duration) -> Self {
        Self {
            status: HealthStatus::Unknown,
            streak: Streak::Passing(0),
            fail_after: unhealthy_threshold.max(1),
            recover_after: healthy_threshold.max(1),
            interval,
        }
    }

    /// Fold one probe outcome in and return the resulting verdict.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        self.streak = match (self.streak, result.passed()) {
            (Streak::Passing(n), true) => Streak::Passing(n.saturating_add(1)),
            (Streak::Failing(n), false) => Streak::Failing(n.saturating_add(1)),
            (_, true) => Streak::Passing(1),
            (_, false) => Streak::Failing(1),
        };

        let verdict = match self.streak {
            Streak::Passing(n) if n >= self.recover_after => HealthStatus::Healthy,
            Streak::Failing(n) if n >= self.fail_after => HealthStatus::Unhealthy,
            _ => self.status,
        };
        if verdict != self.status {
            match verdict {
                HealthStatus::Unhealthy => {
                    warn!(failures = self.consecutive_failures(), threshold = self.fail_after, "task marked unhealthy")
                }
                _ => debug!(from = ?self.status, to = ?verdict, "task health changed"),
            }
            self.status = verdict;
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self.streak {
            Streak::Failing(n) => n,
            Streak::Passing(_) => 0,
        }
    }

    /// Wait before the next probe: the base interval, doubled per
    /// consecutive failure up to one minute.
    pub fn next_interval(&self) -> Duration {
        let doublings = self.consecutive_failures().min(16);
        self.interval
            .saturating_mul(1 << doublings)
            .min(MAX_BACKOFF.max(self.interval))
    }
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("connect: {0}")]
    Connect(#[from] std::io::Error),
    #[error("http: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("request: {0}")]
    Request(#[from] http::Error),
}

async fn fetch_status(address: &str, uri: &str) -> Result<StatusCode, ProbeError> {
    let stream = TcpStream::connect(address).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::get(uri)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, "fleetgrid-health/0.1")
        .body(Empty::<Bytes>::new())?;
    Ok(sender.send_request(request).await?.status())
}

/// GET `http://{address}{path}` within `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");
    match tokio::time::timeout(timeout, fetch_status(address, &uri)).await {
        Ok(Ok(status)) if status.is_success() => ProbeResult::Healthy,
        Ok(Ok(status)) => {
            debug!(%status, %uri, "health endpoint answered non-2xx");
            ProbeResult::Unhealthy
        }
        Ok(Err(e)) => {
            debug!(error = %e, %uri, "health probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
