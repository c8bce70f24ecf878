//! rollgate.toml daemon configuration and rollout manifest parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::spec::RolloutSpec;
use crate::types::Metric;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Backend pools routed by the daemon's weighted router.
    #[serde(rename = "service", default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServicePools>,
}

/// Stable and canary backends (`host:port`) of one workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePools {
    pub name: String,
    #[serde(default)]
    pub stable: Vec<String>,
    #[serde(default)]
    pub canary: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// Which metric source the daemon queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsBackend {
    /// A Prometheus-compatible HTTP query API.
    Prometheus,
    /// The in-process cohort recorder fed through the telemetry endpoint.
    #[default]
    Recorder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub backend: MetricsBackend,
    /// `host:port` of the Prometheus server.
    #[serde(default = "default_prometheus_address")]
    pub prometheus_address: String,
    #[serde(default = "default_query_timeout", with = "duration::serde_str")]
    pub query_timeout: Duration,
    /// PromQL override for the request-count query that backs sample counts.
    #[serde(default)]
    pub count_query: Option<String>,
    /// PromQL overrides keyed by metric name.
    #[serde(default)]
    pub queries: HashMap<Metric, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            backend: MetricsBackend::default(),
            prometheus_address: default_prometheus_address(),
            query_timeout: default_query_timeout(),
            count_query: None,
            queries: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Consecutive metric query errors before a rollout is marked degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    /// How long a rollout may stay degraded before it is aborted.
    #[serde(default = "default_max_degraded", with = "duration::serde_str")]
    pub max_degraded: Duration,
    #[serde(default = "default_write_attempts")]
    pub traffic_write_attempts: u32,
    #[serde(default = "default_backoff_base", with = "duration::serde_str")]
    pub traffic_backoff_base: Duration,
    #[serde(default = "default_backoff_max", with = "duration::serde_str")]
    pub traffic_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
            max_degraded: default_max_degraded(),
            traffic_write_attempts: default_write_attempts(),
            traffic_backoff_base: default_backoff_base(),
            traffic_backoff_max: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// URL (`http://host:port/path` or `host:port/path`) to POST alert JSON to.
    pub webhook: Option<String>,
    /// Number of alerts kept in memory for the API.
    #[serde(default = "default_alert_history")]
    pub history: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook: None,
            history: default_alert_history(),
        }
    }
}

fn default_port() -> u16 {
    8480
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/rollgate")
}
fn default_prometheus_address() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_query_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_degraded_after() -> u32 {
    3
}
fn default_max_degraded() -> Duration {
    Duration::from_secs(600)
}
fn default_write_attempts() -> u32 {
    5
}
fn default_backoff_base() -> Duration {
    Duration::from_millis(200)
}
fn default_backoff_max() -> Duration {
    Duration::from_secs(5)
}
fn default_alert_history() -> usize {
    256
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A TOML file declaring one or more rollouts as `[[rollout]]` tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutManifest {
    #[serde(rename = "rollout", default)]
    pub rollouts: Vec<RolloutSpec>,
}

impl RolloutManifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let manifest: RolloutManifest = toml::from_str(content)?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Comparator;

    #[test]
    fn empty_config_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8480);
        assert_eq!(config.metrics.backend, MetricsBackend::Recorder);
        assert_eq!(config.controller.degraded_after, 3);
        assert_eq!(config.controller.traffic_write_attempts, 5);
        assert_eq!(config.controller.max_degraded, Duration::from_secs(600));
        assert!(config.alerts.webhook.is_none());
        assert!(config.services.is_empty());
    }

    #[test]
    fn parse_service_pools() {
        let config: DaemonConfig = toml::from_str(
            r#"
[[service]]
name = "voyager-gateway"
stable = ["10.0.0.1:8080", "10.0.0.2:8080"]
canary = ["10.0.1.1:8080"]

[[service]]
name = "ledger"
"#,
        )
        .unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].stable.len(), 2);
        assert_eq!(config.services[0].canary, vec!["10.0.1.1:8080".to_string()]);
        assert!(config.services[1].canary.is_empty());
    }

    #[test]
    fn parse_prometheus_section() {
        let toml_str = r#"
[server]
port = 9000
data_dir = "/tmp/rollgate"

[metrics]
backend = "prometheus"
prometheus_address = "prom:9090"
query_timeout = "750ms"

[metrics.queries]
success_rate = "sum(rate(ok{ {selector} }[{window}]))"
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.metrics.backend, MetricsBackend::Prometheus);
        assert_eq!(config.metrics.query_timeout, Duration::from_millis(750));
        assert!(config.metrics.queries.contains_key(&Metric::SuccessRate));
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = DaemonConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let back: DaemonConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.controller.traffic_backoff_base, Duration::from_millis(200));
    }

    #[test]
    fn parse_manifest() {
        let manifest = RolloutManifest::parse(
            r#"
[[rollout]]
workload = "voyager-gateway"
stable_version = "1.0.0"
canary_version = "1.1.0"
steps = [
  { weight = 10, pause = "30s" },
  { weight = 100, pause = "1m" },
]

[[rollout.checks]]
name = "success-rate"
metric = "success_rate"
comparator = ">="
threshold = 99.0
consecutive_failures_to_fail = 2
interval = "10s"

[[rollout.rollback_thresholds]]
name = "success-floor"
metric = "success_rate"
comparator = "<"
threshold = 98.0
"#,
        )
        .unwrap();

        assert_eq!(manifest.rollouts.len(), 1);
        let spec = &manifest.rollouts[0];
        assert_eq!(spec.steps[0].weight_percent, 10);
        assert_eq!(spec.steps[1].pause, Duration::from_secs(60));
        assert_eq!(spec.checks[0].comparator, Comparator::Ge);
        assert_eq!(spec.rollback_thresholds[0].evaluation_interval, Duration::from_secs(10));
        assert_eq!(spec.validate(), Ok(()));
    }

    #[test]
    fn manifest_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.toml");
        std::fs::write(
            &path,
            "[[rollout]]\nworkload = \"w\"\nstable_version = \"a\"\ncanary_version = \"b\"\nsteps = [{ weight = 100, pause = \"5s\" }]\n",
        )
        .unwrap();
        let manifest = RolloutManifest::from_file(&path).unwrap();
        assert_eq!(manifest.rollouts[0].workload, "w");
        assert!(manifest.rollouts[0].checks.is_empty());
    }
}
