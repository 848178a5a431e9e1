//! Alert sinks for failed backups and missing backups
//!
//! Alerts are fire-and-forget: a sink that cannot deliver logs the problem
//! and carries on, it never replaces the error being reported.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;

use crate::database::{BackupError, Result};

/// Extra information attached to a captured error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertContext {
    pub tags: BTreeMap<String, String>,
    /// Grouping key; an empty list lets the sink group by its own rules
    pub fingerprint: Vec<String>,
}

impl AlertContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_tag(key, value);
        self
    }

    pub fn set_tag(&mut self, key: &str, value: impl Into<String>) {
        self.tags.insert(key.to_string(), value.into());
    }

    /// Make every capture a distinct incident
    ///
    /// The wall-clock component keeps a failure that repeats every night
    /// from being folded into the first occurrence.
    pub fn with_unique_fingerprint(mut self) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.fingerprint = vec!["{{ default }}".to_string(), format!("{:.6}", now)];
        self
    }
}

/// Receives captured errors
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn capture(&self, error: &BackupError, context: &AlertContext);
}

/// Alert sink used when no error-reporting service is configured
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn capture(&self, error: &BackupError, context: &AlertContext) {
        error!(kind = error.kind(), tags = ?context.tags, "Alert: {}", error);
    }
}

/// Reports errors to a Sentry project through its store endpoint
pub struct SentryAlertSink {
    http: reqwest::Client,
    store_url: Url,
    public_key: String,
    server_name: String,
}

impl SentryAlertSink {
    /// Build a sink from a DSN such as `https://<key>@sentry.example.com/42`
    pub fn from_dsn(dsn: &str, server_name: &str) -> Result<Self> {
        let (store_url, public_key) = parse_dsn(dsn)?;
        let http = reqwest::Client::builder()
            .user_agent(client_name())
            .build()
            .map_err(|e| BackupError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            store_url,
            public_key,
            server_name: server_name.to_string(),
        })
    }

    fn event(&self, error: &BackupError, context: &AlertContext) -> serde_json::Value {
        let mut event = json!({
            "event_id": uuid::Uuid::new_v4().simple().to_string(),
            "timestamp": Utc::now().to_rfc3339(),
            "platform": "other",
            "level": "error",
            "logger": env!("CARGO_PKG_NAME"),
            "server_name": self.server_name,
            "message": error.to_string(),
            "exception": {
                "values": [{ "type": error.kind(), "value": error.to_string() }]
            },
            "tags": context.tags,
        });
        if !context.fingerprint.is_empty() {
            event["fingerprint"] = json!(context.fingerprint);
        }
        event
    }

    fn auth_header(&self) -> String {
        format!(
            "Sentry sentry_version=7, sentry_client={}, sentry_timestamp={}, sentry_key={}",
            client_name(),
            Utc::now().timestamp(),
            self.public_key
        )
    }
}

#[async_trait]
impl AlertSink for SentryAlertSink {
    async fn capture(&self, error: &BackupError, context: &AlertContext) {
        let sent = self
            .http
            .post(self.store_url.clone())
            .header("X-Sentry-Auth", self.auth_header())
            .json(&self.event(error, context))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match sent {
            Ok(_) => info!("Reported {} to Sentry", error.kind()),
            Err(e) => warn!("Failed to report error to Sentry: {}", e),
        }
    }
}

fn client_name() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Split a DSN into the store endpoint and the public key
fn parse_dsn(dsn: &str) -> Result<(Url, String)> {
    let invalid = |reason: &str| BackupError::Config(format!("invalid Sentry DSN: {}", reason));

    let url = Url::parse(dsn).map_err(|e| invalid(&e.to_string()))?;
    let public_key = url.username();
    if public_key.is_empty() {
        return Err(invalid("missing public key"));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;

    let mut segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let project_id = segments.pop().ok_or_else(|| invalid("missing project id"))?;

    let mut store = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        store.push_str(&format!(":{}", port));
    }
    for segment in segments {
        store.push('/');
        store.push_str(segment);
    }
    store.push_str(&format!("/api/{}/store/", project_id));

    let store_url = Url::parse(&store).map_err(|e| invalid(&e.to_string()))?;
    Ok((store_url, public_key.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Keeps every captured alert for assertions
    #[derive(Default)]
    pub(crate) struct RecordingAlertSink {
        pub alerts: Mutex<Vec<(String, AlertContext)>>,
    }

    impl RecordingAlertSink {
        pub(crate) fn alerts(&self) -> Vec<(String, AlertContext)> {
            self.alerts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn capture(&self, error: &BackupError, context: &AlertContext) {
            self.alerts
                .lock()
                .unwrap()
                .push((error.kind().to_string(), context.clone()));
        }
    }

    #[test]
    fn test_parse_dsn() {
        let (url, key) = parse_dsn("https://abc123@sentry.example.com/42").unwrap();
        assert_eq!(url.as_str(), "https://sentry.example.com/api/42/store/");
        assert_eq!(key, "abc123");

        let (url, _) = parse_dsn("http://abc@localhost:9000/prefix/7").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/prefix/api/7/store/");
    }

    #[test]
    fn test_parse_dsn_rejects_incomplete() {
        assert!(parse_dsn("not a url").is_err());
        assert!(parse_dsn("https://sentry.example.com/42").is_err());
        assert!(parse_dsn("https://abc@sentry.example.com/").is_err());
    }

    #[test]
    fn test_unique_fingerprint() {
        let context = AlertContext::new().with_unique_fingerprint();
        assert_eq!(context.fingerprint.len(), 2);
        assert_eq!(context.fingerprint[0], "{{ default }}");
        assert!(context.fingerprint[1].parse::<f64>().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_sentry_sink_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/42/store/"))
            .and(header_regex("x-sentry-auth", "sentry_key=public"))
            .and(body_partial_json(serde_json::json!({
                "level": "error",
                "server_name": "host1",
                "exception": {"values": [{"type": "NoBackupsFound"}]},
                "tags": {"bucket": "nightly"},
                "fingerprint": ["{{ default }}", "1"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dsn = format!("http://public@{}/42", server.address());
        let sink = SentryAlertSink::from_dsn(&dsn, "host1").unwrap();
        let context = AlertContext {
            tags: BTreeMap::from([("bucket".to_string(), "nightly".to_string())]),
            fingerprint: vec!["{{ default }}".to_string(), "1".to_string()],
        };

        sink.capture(&BackupError::NoBackupsFound, &context).await;
    }

    #[tokio::test]
    async fn test_sentry_delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dsn = format!("http://public@{}/42", server.address());
        let sink = SentryAlertSink::from_dsn(&dsn, "host1").unwrap();
        sink.capture(&BackupError::NoBackupsFound, &AlertContext::new())
            .await;
    }
}
