//! Alert sinks.
//!
//! The state machine emits an [`Alert`] on every abort, degrade,
//! recovery and success, on rollback-threshold breach, and when a
//! rollback cannot be applied. Sinks must not block the machine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use rollgate_core::RolloutId;

use crate::retry::Backoff;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Aborting,
    Degraded,
    Recovered,
    Succeeded,
    ThresholdBreach,
    RollbackFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

impl AlertKind {
    pub fn severity(&self) -> Severity {
        match self {
            AlertKind::Succeeded | AlertKind::Recovered => Severity::Info,
            AlertKind::Degraded => Severity::Warning,
            AlertKind::Aborting | AlertKind::ThresholdBreach => Severity::Critical,
            AlertKind::RollbackFailed => Severity::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub rollout_id: RolloutId,
    pub workload: String,
    pub step: usize,
    pub weight: u8,
    #[serde(default)]
    pub failing_checks: Vec<String>,
    pub message: String,
    /// Unix millis.
    pub at: u64,
}

/// Receives alerts. Implementations return promptly.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, alert: &Alert) {
        let checks = alert.failing_checks.join(",");
        match alert.severity {
            Severity::Info => info!(
                rollout = %alert.rollout_id,
                workload = %alert.workload,
                step = alert.step,
                weight = alert.weight,
                kind = ?alert.kind,
                "{}", alert.message
            ),
            Severity::Warning => warn!(
                rollout = %alert.rollout_id,
                workload = %alert.workload,
                step = alert.step,
                weight = alert.weight,
                kind = ?alert.kind,
                "{}", alert.message
            ),
            Severity::Critical | Severity::Fatal => error!(
                rollout = %alert.rollout_id,
                workload = %alert.workload,
                step = alert.step,
                weight = alert.weight,
                kind = ?alert.kind,
                severity = ?alert.severity,
                failing_checks = %checks,
                "{}", alert.message
            ),
        }
    }
}

/// Keeps the most recent alerts in memory.
#[derive(Debug, Clone)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<VecDeque<Alert>>>,
    capacity: usize,
}

impl MemoryAlertSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Alerts oldest first.
    pub fn recent(&self) -> Vec<Alert> {
        let alerts = self.alerts.lock().expect("alerts lock");
        alerts.iter().cloned().collect()
    }

    /// Alerts for one rollout, oldest first.
    pub fn for_rollout(&self, rollout_id: &str) -> Vec<Alert> {
        let alerts = self.alerts.lock().expect("alerts lock");
        alerts
            .iter()
            .filter(|a| a.rollout_id == rollout_id)
            .cloned()
            .collect()
    }
}

impl Default for MemoryAlertSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl AlertSink for MemoryAlertSink {
    fn emit(&self, alert: &Alert) {
        let mut alerts = self.alerts.lock().expect("alerts lock");
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert.clone());
    }
}

/// Forwards each alert to every inner sink.
#[derive(Clone, Default)]
pub struct AlertFanout {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AlertSink for AlertFanout {
    fn emit(&self, alert: &Alert) {
        for sink in &self.sinks {
            sink.emit(alert);
        }
    }
}

/// POSTs each alert as JSON to an HTTP endpoint.
///
/// Delivery runs on a background task. Each attempt has a timeout;
/// connection failures, timeouts and 5xx responses are retried with
/// backoff, and the alert is dropped once the attempts are exhausted.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    address: String,
    host: String,
    path: String,
    timeout: Duration,
    backoff: Backoff,
}

impl WebhookAlertSink {
    /// Accepts `http://host:port/path` or `host:port/path`.
    pub fn new(target: &str) -> Result<Self, url::ParseError> {
        let with_scheme = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let url = url::Url::parse(&with_scheme)?;
        let host = url.host_str().ok_or(url::ParseError::EmptyHost)?.to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            address: format!("{host}:{port}"),
            host,
            path,
            timeout: Duration::from_secs(5),
            backoff: Backoff {
                attempts: 3,
                base: Duration::from_millis(500),
                max: Duration::from_secs(2),
            },
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.address, self.path)
    }
}

impl AlertSink for WebhookAlertSink {
    fn emit(&self, alert: &Alert) {
        let body = match serde_json::to_vec(alert) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode alert");
                return;
            }
        };
        let sink = self.clone();
        tokio::spawn(async move { sink.deliver(body).await });
    }
}

impl WebhookAlertSink {
    async fn deliver(&self, body: Vec<u8>) {
        let attempts = self.backoff.attempts.max(1);
        for attempt in 1..=attempts {
            let sent = tokio::time::timeout(self.timeout, post_json(self, body.clone())).await;
            let failure = match sent {
                Ok(Ok(status)) if status.is_success() => {
                    debug!(endpoint = %self.endpoint(), attempt, "alert delivered");
                    return;
                }
                Ok(Ok(status)) if status.is_client_error() => {
                    warn!(endpoint = %self.endpoint(), %status, "alert webhook rejected alert");
                    return;
                }
                Ok(Ok(status)) => format!("status {status}"),
                Ok(Err(e)) => e,
                Err(_) => "timed out".to_string(),
            };
            if attempt == attempts {
                warn!(
                    endpoint = %self.endpoint(),
                    attempts,
                    error = %failure,
                    "alert webhook failed, alert dropped"
                );
                return;
            }
            let delay = self.backoff.delay(attempt);
            debug!(
                endpoint = %self.endpoint(),
                attempt,
                error = %failure,
                retry_in = ?delay,
                "alert webhook failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

async fn post_json(sink: &WebhookAlertSink, body: Vec<u8>) -> Result<http::StatusCode, String> {
    let stream = tokio::net::TcpStream::connect(&sink.address)
        .await
        .map_err(|e| e.to_string())?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| e.to_string())?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("POST")
        .uri(&sink.path)
        .header("host", &sink.host)
        .header("content-type", "application/json")
        .header("user-agent", "rollgate/0.1")
        .body(http_body_util::Full::new(bytes::Bytes::from(body)))
        .map_err(|e| e.to_string())?;

    let resp = sender.send_request(req).await.map_err(|e| e.to_string())?;
    Ok(resp.status())
}
