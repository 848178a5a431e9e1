//! Backup freshness metric and its Prometheus Pushgateway sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use tracing::info;

use crate::database::{BackupError, Result};

/// Job name the freshness metric is grouped under on the gateway
pub const MONITOR_JOB: &str = "backups_monitor";

const METRIC_NAME: &str = "backups_timestamp";

/// Age signal for the newest backup of one kind on one host
#[derive(Debug, Clone, PartialEq)]
pub struct FreshnessMetric {
    pub instance: String,
    pub kind: String,
    /// Seconds since the epoch, fractional
    pub timestamp_seconds: f64,
}

impl FreshnessMetric {
    pub fn new(instance: &str, kind: &str, last_modified: DateTime<Utc>) -> Self {
        let timestamp_seconds =
            last_modified.timestamp() as f64 + f64::from(last_modified.timestamp_subsec_micros()) / 1e6;
        Self {
            instance: instance.to_string(),
            kind: kind.to_string(),
            timestamp_seconds,
        }
    }

    /// Text exposition format body for this metric
    pub fn exposition(&self) -> String {
        format!(
            "{}{{type=\"{}\"}} {:.6}\n",
            METRIC_NAME,
            escape_label_value(&self.kind),
            self.timestamp_seconds
        )
    }
}

/// Escape a label value for the text exposition format
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Receives freshness metrics
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn push(&self, metric: &FreshnessMetric) -> Result<()>;
}

/// Pushes metrics to a Prometheus Pushgateway, replacing the group
pub struct PushgatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl PushgatewayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BackupError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn group_url(&self, instance: &str) -> String {
        format!(
            "{}/metrics/job/{}/instance/{}",
            self.base_url, MONITOR_JOB, instance
        )
    }
}

#[async_trait]
impl MetricsSink for PushgatewayClient {
    async fn push(&self, metric: &FreshnessMetric) -> Result<()> {
        let url = self.group_url(&metric.instance);
        self.http
            .post(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(metric.exposition())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BackupError::Metrics(format!("push to {} failed: {}", url, e)))?;

        info!(
            "Pushed {} freshness {:.6} for {}",
            metric.kind, metric.timestamp_seconds, metric.instance
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Keeps pushed metrics, optionally failing every push
    #[derive(Default)]
    pub(crate) struct RecordingMetricsSink {
        pub pushed: Mutex<Vec<FreshnessMetric>>,
        pub fail: bool,
    }

    impl RecordingMetricsSink {
        pub(crate) fn pushed(&self) -> Vec<FreshnessMetric> {
            self.pushed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetricsSink for RecordingMetricsSink {
        async fn push(&self, metric: &FreshnessMetric) -> Result<()> {
            if self.fail {
                return Err(BackupError::Metrics("gateway down".to_string()));
            }
            self.pushed.lock().unwrap().push(metric.clone());
            Ok(())
        }
    }

    #[test]
    fn test_exposition_line() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::microseconds(250_000);
        let metric = FreshnessMetric::new("host1", "mysql", ts);

        assert_eq!(metric.timestamp_seconds, 1_704_164_645.25);
        assert_eq!(
            metric.exposition(),
            "backups_timestamp{type=\"mysql\"} 1704164645.250000\n"
        );
    }

    #[test]
    fn test_label_value_is_escaped() {
        let metric = FreshnessMetric {
            instance: "host1".to_string(),
            kind: "my\"sql\\\nx".to_string(),
            timestamp_seconds: 1.5,
        };
        assert_eq!(
            metric.exposition(),
            "backups_timestamp{type=\"my\\\"sql\\\\\\nx\"} 1.500000\n"
        );
        assert_eq!(metric.exposition().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_push_posts_to_instance_group() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics/job/backups_monitor/instance/host1"))
            .and(header("content-type", "application/octet-stream"))
            .and(body_string("backups_timestamp{type=\"mongodb\"} 1704067200.000000\n"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = PushgatewayClient::new(&format!("{}/", server.uri())).unwrap();
        let metric = FreshnessMetric::new(
            "host1",
            "mongodb",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        client.push(&metric).await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_rejection_is_metrics_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = PushgatewayClient::new(&server.uri()).unwrap();
        let metric = FreshnessMetric::new("host1", "mysql", Utc::now());
        let err = client.push(&metric).await.unwrap_err();
        assert!(matches!(err, BackupError::Metrics(_)));
    }
}
