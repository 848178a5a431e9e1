//! Dead-man's switch for shipped backups
//!
//! Finds the newest remote artifact for this host and kind and pushes its
//! age as a freshness metric. Any failure is alerted rather than returned;
//! a missing or stale metric is what pages someone.

use std::sync::Arc;

use tracing::{Instrument, error, info, info_span};

use crate::alerts::{AlertContext, AlertSink};
use crate::database::backup_naming::BackupNamingService;
use crate::database::storage::{RemoteArtifactRecord, StorageProvider};
use crate::database::{BackupError, Result};
use crate::metrics::{FreshnessMetric, MetricsSink};

/// Newest record whose key starts with `prefix`
///
/// Identical modification times are broken by the greatest key, which for
/// dated names is the latest day.
pub fn select_most_recent<'a>(
    records: &'a [RemoteArtifactRecord],
    prefix: &str,
) -> Option<&'a RemoteArtifactRecord> {
    records
        .iter()
        .filter(|r| r.key.starts_with(prefix))
        .max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        })
}

/// Checks the freshness of one host's backups in one bucket
pub struct BackupMonitor {
    storage: Arc<dyn StorageProvider>,
    metrics: Arc<dyn MetricsSink>,
    alerts: Arc<dyn AlertSink>,
    naming: BackupNamingService,
}

impl BackupMonitor {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        metrics: Arc<dyn MetricsSink>,
        alerts: Arc<dyn AlertSink>,
        naming: BackupNamingService,
    ) -> Self {
        Self {
            storage,
            metrics,
            alerts,
            naming,
        }
    }

    /// Check the backups of `kind` and report the outcome
    ///
    /// Returns the metric that was pushed, or `None` after alerting.
    pub async fn run(&self, kind: &str) -> Option<FreshnessMetric> {
        let span = info_span!("monitor", kind, bucket = self.storage.bucket());
        let mut context = AlertContext::new().with_tag("bucket", self.storage.bucket());

        let checked = self.check(kind, &mut context).instrument(span).await;
        match checked {
            Ok(metric) => Some(metric),
            Err(e) => {
                error!("Backup monitor for {} failed: {}", kind, e);
                context.set_tag("kind", kind);
                self.alerts.capture(&e, &context).await;
                None
            }
        }
    }

    async fn check(&self, kind: &str, context: &mut AlertContext) -> Result<FreshnessMetric> {
        let prefix = self.naming.prefix(kind);
        let records = self.storage.list_objects().await?;

        let newest = select_most_recent(&records, &prefix).ok_or(BackupError::NoBackupsFound)?;
        context.set_tag("most_recent", newest.key.as_str());
        info!(
            "Most recent {} backup is \"{}\" from {}",
            kind, newest.key, newest.last_modified
        );

        let metric = FreshnessMetric::new(self.naming.hostname(), kind, newest.last_modified);
        self.metrics.push(&metric).await?;
        Ok(metric)
    }
}
