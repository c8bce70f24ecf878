//! Prometheus query adapter.
//!
//! Issues instant queries against `/api/v1/query` on a Prometheus-style
//! backend. Each metric maps to a PromQL template with two placeholders:
//! `{selector}` (cohort label matchers) and `{window}` (range duration).
//! A second template counts requests in the window so that "no traffic"
//! is reported as zero samples rather than as a value.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use serde::Deserialize;
use tracing::debug;

use rollgate_core::{CohortLabels, Metric, duration};

use crate::source::{MetricQueryError, MetricSample, MetricSource};

/// PromQL templates, one per metric plus the sample-count query.
#[derive(Debug, Clone)]
pub struct QueryTemplates {
    pub queries: HashMap<Metric, String>,
    pub count: String,
}

impl Default for QueryTemplates {
    /// Templates over the series the voyager-gateway workload exports.
    fn default() -> Self {
        let mut queries = HashMap::new();
        queries.insert(
            Metric::SuccessRate,
            "100 * sum(rate(voyager_authorization_total{status=\"approved\",{selector}}[{window}])) \
             / sum(rate(voyager_authorization_total{{selector}}[{window}]))"
                .to_string(),
        );
        for metric in [Metric::LatencyP50, Metric::LatencyP95, Metric::LatencyP99] {
            let q = metric.quantile().unwrap_or(0.99);
            queries.insert(
                metric,
                format!(
                    "1000 * histogram_quantile({q}, sum by (le) \
                     (rate(voyager_authorization_duration_seconds_bucket{{{{selector}}}}[{{window}}])))"
                ),
            );
        }
        queries.insert(
            Metric::ErrorCount,
            "sum(increase(voyager_authorization_total{status=\"declined\",{selector}}[{window}]))"
                .to_string(),
        );
        Self {
            queries,
            count: "sum(increase(voyager_authorization_total{{selector}}[{window}]))".to_string(),
        }
    }
}

impl QueryTemplates {
    /// Defaults with per-metric overrides applied.
    pub fn with_overrides(overrides: &HashMap<Metric, String>, count: Option<&str>) -> Self {
        let mut templates = Self::default();
        for (metric, query) in overrides {
            templates.queries.insert(*metric, query.clone());
        }
        if let Some(count) = count {
            templates.count = count.to_string();
        }
        templates
    }
}

/// Label matchers selecting one cohort: `app="...",version="..."`.
pub fn selector(cohort: &CohortLabels) -> String {
    format!(
        "app=\"{}\",version=\"{}\"",
        escape_label(&cohort.workload),
        escape_label(&cohort.version)
    )
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Substitute `{selector}` and `{window}` into a template.
pub fn render_query(template: &str, cohort: &CohortLabels, window: Duration) -> String {
    template
        .replace("{selector}", &selector(cohort))
        .replace("{window}", &duration::format(window))
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

/// Decode an instant-query response body into a single scalar.
///
/// Returns `Ok(None)` for an empty vector or a NaN value (no traffic).
pub fn parse_scalar(body: &[u8]) -> Result<Option<f64>, MetricQueryError> {
    let resp: QueryResponse =
        serde_json::from_slice(body).map_err(|e| MetricQueryError::Decode(e.to_string()))?;
    if resp.status != "success" {
        return Err(MetricQueryError::Backend(
            resp.error.unwrap_or_else(|| resp.status.clone()),
        ));
    }
    let data = resp
        .data
        .ok_or_else(|| MetricQueryError::Decode("missing data".to_string()))?;

    let raw = match data.result_type.as_str() {
        "vector" => {
            let items = data
                .result
                .as_array()
                .ok_or_else(|| MetricQueryError::Decode("vector result is not an array".to_string()))?;
            match items.first() {
                Some(item) => item.get("value").cloned(),
                None => return Ok(None),
            }
        }
        "scalar" => Some(data.result),
        other => {
            return Err(MetricQueryError::Decode(format!(
                "unsupported result type: {other}"
            )));
        }
    };

    let value = raw
        .as_ref()
        .and_then(|v| v.get(1))
        .and_then(|v| v.as_str())
        .ok_or_else(|| MetricQueryError::Decode("missing sample value".to_string()))?;
    let value: f64 = value
        .parse()
        .map_err(|_| MetricQueryError::Decode(format!("non-numeric sample value: {value}")))?;
    if value.is_nan() {
        return Ok(None);
    }
    Ok(Some(value))
}

/// Metric source backed by a Prometheus-compatible HTTP API.
pub struct PrometheusSource {
    /// `host:port` of the query API.
    address: String,
    templates: QueryTemplates,
}

impl PrometheusSource {
    pub fn new(address: &str, templates: QueryTemplates) -> Self {
        Self {
            address: address.to_string(),
            templates,
        }
    }

    async fn instant_query(&self, promql: &str) -> Result<Option<f64>, MetricQueryError> {
        let encoded: String = url::form_urlencoded::byte_serialize(promql.as_bytes()).collect();
        let path = format!("/api/v1/query?query={encoded}");
        let uri = format!("http://{}{path}", self.address);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| MetricQueryError::Transport(e.to_string()))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| MetricQueryError::Transport(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&path)
            .header("host", &self.address)
            .header("accept", "application/json")
            .header("user-agent", "rollgate/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| MetricQueryError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| MetricQueryError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| MetricQueryError::Transport(e.to_string()))?
            .to_bytes();

        // Prometheus reports bad queries as 4xx with a JSON error body.
        if !status.is_success() {
            return Err(match parse_scalar(&body) {
                Err(MetricQueryError::Backend(msg)) => MetricQueryError::Backend(msg),
                _ => MetricQueryError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                },
            });
        }

        debug!(%uri, "prometheus query ok");
        parse_scalar(&body)
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn query(
        &self,
        metric: Metric,
        cohort: &CohortLabels,
        window: Duration,
    ) -> Result<MetricSample, MetricQueryError> {
        let count_query = render_query(&self.templates.count, cohort, window);
        let count = self.instant_query(&count_query).await?.unwrap_or(0.0);
        if count <= 0.0 {
            return Ok(MetricSample::empty());
        }
        let sample_count = count.round().max(1.0) as u64;

        let template = self
            .templates
            .queries
            .get(&metric)
            .ok_or_else(|| MetricQueryError::Backend(format!("no query template for {metric}")))?;
        let promql = render_query(template, cohort, window);
        match self.instant_query(&promql).await? {
            Some(value) => Ok(MetricSample::new(value, sample_count)),
            None => Ok(MetricSample::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use rollgate_core::Cohort;

    fn canary() -> CohortLabels {
        CohortLabels {
            rollout_id: "r-1".to_string(),
            workload: "voyager-gateway".to_string(),
            cohort: Cohort::Canary,
            version: "1.1.0".to_string(),
        }
    }

    #[test]
    fn renders_selector_and_window() {
        let templates = QueryTemplates::default();
        let q = render_query(
            &templates.queries[&Metric::SuccessRate],
            &canary(),
            Duration::from_secs(60),
        );
        assert!(q.contains(
            "voyager_authorization_total{status=\"approved\",app=\"voyager-gateway\",version=\"1.1.0\"}[1m]"
        ));
        assert!(q.contains("voyager_authorization_total{app=\"voyager-gateway\",version=\"1.1.0\"}[1m]"));
    }

    #[test]
    fn latency_templates_use_quantiles() {
        let templates = QueryTemplates::default();
        let q = render_query(
            &templates.queries[&Metric::LatencyP99],
            &canary(),
            Duration::from_secs(30),
        );
        assert!(q.starts_with("1000 * histogram_quantile(0.99,"));
        assert!(q.contains("_bucket{app=\"voyager-gateway\",version=\"1.1.0\"}[30s]"));
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert(Metric::ErrorCount, "custom{{selector}}".to_string());
        let templates = QueryTemplates::with_overrides(&overrides, Some("count{{selector}}"));
        assert_eq!(templates.queries[&Metric::ErrorCount], "custom{{selector}}");
        assert_eq!(templates.count, "count{{selector}}");
        assert!(templates.queries.contains_key(&Metric::SuccessRate));
    }

    #[test]
    fn parse_vector_result() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1700000000.1,"99.8"]}]}}"#;
        assert_eq!(parse_scalar(body).unwrap(), Some(99.8));
    }

    #[test]
    fn empty_vector_and_nan_are_no_data() {
        let empty = br#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert_eq!(parse_scalar(empty).unwrap(), None);

        let nan = br#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1.0,"NaN"]}]}}"#;
        assert_eq!(parse_scalar(nan).unwrap(), None);
    }

    #[test]
    fn error_status_is_backend_error() {
        let body = br#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        assert_eq!(
            parse_scalar(body),
            Err(MetricQueryError::Backend("parse error".to_string()))
        );
    }

    #[test]
    fn garbage_is_decode_error() {
        assert!(matches!(parse_scalar(b"<html>"), Err(MetricQueryError::Decode(_))));
    }

    #[tokio::test]
    async fn unreachable_backend_is_transport_error() {
        let source = PrometheusSource::new("127.0.0.1:1", QueryTemplates::default());
        let err = source
            .query(Metric::SuccessRate, &canary(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, MetricQueryError::Transport(_)));
    }

    /// Serve one canned JSON body per connection.
    async fn serve(bodies: Vec<&'static str>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            for body in bodies {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await.unwrap();
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
                sock.shutdown().await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn queries_count_then_value() {
        let addr = serve(vec![
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1.0,"1200"]}]}}"#,
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1.0,"99.8"]}]}}"#,
        ])
        .await;
        let source = PrometheusSource::new(&addr, QueryTemplates::default());
        let sample = source
            .query(Metric::SuccessRate, &canary(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(sample, MetricSample::new(99.8, 1200));
    }

    #[tokio::test]
    async fn zero_count_short_circuits_to_empty() {
        let addr = serve(vec![
            r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#,
        ])
        .await;
        let source = PrometheusSource::new(&addr, QueryTemplates::default());
        let sample = source
            .query(Metric::SuccessRate, &canary(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(sample.is_empty());
    }
}
