//! Health check probe logic.
//!
//! A [`HealthTracker`] applies the delay/timeout policy to a stream of probe
//! results for one executor. Probes themselves are pluggable through the
//! [`Prober`] trait; [`HttpProber`] issues a GET against the executor's
//! client port.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use keel_core::HealthSettings;
use keel_state::{Generation, SlotId, TaskId};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The executor acknowledged the probe.
    Healthy,
    /// The executor answered but reported a problem.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

/// The executor a probe is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub slot_id: SlotId,
    pub generation: Generation,
    pub task_id: TaskId,
    pub hostname: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Issues one liveness probe against an executor.
pub trait Prober: Send + Sync {
    fn probe(&self, target: &ProbeTarget) -> BoxFuture<ProbeResult>;
}

/// Where an executor stands relative to its acknowledgment deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Inside the delay window with no acknowledgment yet.
    Grace,
    /// Past the delay window, still waiting for the first acknowledgment.
    Waiting,
    /// Acknowledged recently enough.
    Healthy,
    /// No acknowledgment for longer than `delay + timeout`.
    Overdue,
}

/// Tracks acknowledgments for a single executor.
#[derive(Debug)]
pub struct HealthTracker {
    policy: HealthSettings,
    started: Instant,
    last_ack: Option<Instant>,
    consecutive_failures: u32,
}

impl HealthTracker {
    /// Start tracking with a fresh grace period beginning at `now`.
    pub fn new(policy: HealthSettings, now: Instant) -> Self {
        Self {
            policy,
            started: now,
            last_ack: None,
            consecutive_failures: 0,
        }
    }

    /// Record a probe result observed at `now` and return the verdict.
    pub fn record(&mut self, result: ProbeResult, now: Instant) -> HealthVerdict {
        match result {
            ProbeResult::Healthy => {
                if self.consecutive_failures > 0 {
                    debug!(
                        failures = self.consecutive_failures,
                        "executor acknowledged again"
                    );
                }
                self.consecutive_failures = 0;
                self.last_ack = Some(now);
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
            }
        }

        let verdict = self.verdict(now);
        if verdict == HealthVerdict::Overdue {
            warn!(
                failures = self.consecutive_failures,
                silent_for = ?self.silent_for(now),
                "executor acknowledgment overdue"
            );
        }
        verdict
    }

    pub fn verdict(&self, now: Instant) -> HealthVerdict {
        if now > self.deadline() {
            return HealthVerdict::Overdue;
        }
        match self.last_ack {
            Some(_) => HealthVerdict::Healthy,
            None if now < self.started + self.policy.delay => HealthVerdict::Grace,
            None => HealthVerdict::Waiting,
        }
    }

    /// Instant after which a missing acknowledgment counts as failure.
    pub fn deadline(&self) -> Instant {
        self.last_ack.unwrap_or(self.started) + self.policy.delay + self.policy.timeout
    }

    /// Time since the last acknowledgment (or since monitoring started).
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_ack.unwrap_or(self.started))
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// GETs `path` on the executor's client port; 2xx is an acknowledgment.
#[derive(Debug, Clone)]
pub struct HttpProber {
    path: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

impl Prober for HttpProber {
    fn probe(&self, target: &ProbeTarget) -> BoxFuture<ProbeResult> {
        let address = target.address();
        let path = self.path.clone();
        let timeout = self.timeout;
        Box::pin(async move { http_probe(&address, &path, timeout).await })
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "keel-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
