//! Backup pipeline: dump, compress and ship one database
//!
//! A run never raises. Whatever stage fails, the error is logged and
//! reported to the alert sink, the local artifacts are removed, and the
//! outcome is handed back to the caller to pick an exit code.

use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument, error, info, info_span};

use crate::alerts::{AlertContext, AlertSink};
use crate::config::BackupConfig;
use crate::database::archive::compress_backup;
use crate::database::backup_naming::BackupNamingService;
use crate::database::cleanup::CleanupGuard;
use crate::database::dump::{dump_service, dump_target};
use crate::database::process::CommandRunner;
use crate::database::storage::StorageProvider;
use crate::database::BackupError;

/// How a backup run ended
#[derive(Debug)]
pub enum BackupOutcome {
    /// The artifact was committed to the bucket under `key`
    Shipped { key: String },
    /// A stage failed; the error has already been alerted
    Failed(BackupError),
}

impl BackupOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupOutcome::Shipped { .. } => 0,
            BackupOutcome::Failed(_) => 1,
        }
    }
}

/// Pipeline stage a failure happened in, reported as an alert tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Dump,
    Compress,
    Transfer,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Dump => "dump",
            Stage::Compress => "compress",
            Stage::Transfer => "transfer",
        }
    }
}

/// Runs Dump, Compress and Transfer for one service
pub struct BackupPipeline {
    runner: Arc<dyn CommandRunner>,
    storage: Arc<dyn StorageProvider>,
    alerts: Arc<dyn AlertSink>,
    naming: BackupNamingService,
    config: BackupConfig,
}

impl BackupPipeline {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        storage: Arc<dyn StorageProvider>,
        alerts: Arc<dyn AlertSink>,
        naming: BackupNamingService,
        config: BackupConfig,
    ) -> Self {
        Self {
            runner,
            storage,
            alerts,
            naming,
            config,
        }
    }

    /// Back up `service` and ship it to the configured bucket
    pub async fn run(&self, service: &str) -> BackupOutcome {
        let span = info_span!(
            "backup",
            service,
            provider = self.storage.name(),
            bucket = self.storage.bucket()
        );

        // Declared first so it drops last, after the alert has gone out.
        let mut guard = CleanupGuard::new();

        match self.ship(service, &mut guard).instrument(span).await {
            Ok(key) => {
                info!("Backup of {} shipped as \"{}\"", service, key);
                BackupOutcome::Shipped { key }
            }
            Err((stage, e)) => {
                error!("Backup of {} failed during {}: {}", service, stage.as_str(), e);
                let context = AlertContext::new()
                    .with_unique_fingerprint()
                    .with_tag("stage", stage.as_str())
                    .with_tag("kind", service)
                    .with_tag("bucket", self.storage.bucket());
                self.alerts.capture(&e, &context).await;
                BackupOutcome::Failed(e)
            }
        }
    }

    async fn ship(
        &self,
        service: &str,
        guard: &mut CleanupGuard,
    ) -> Result<String, (Stage, BackupError)> {
        let at = |stage: Stage| move |e: BackupError| (stage, e);

        tokio::fs::create_dir_all(&self.config.backup_dir)
            .await
            .map_err(|e| (Stage::Dump, BackupError::Io(e)))?;

        let (kind, raw) = dump_target(&self.naming, service, &self.config.backup_dir)
            .map_err(at(Stage::Dump))?;
        // Tracked before the dump runs so partial output is removed as well.
        guard.track(&raw);
        dump_service(
            self.runner.as_ref(),
            kind,
            &raw,
            Some(&self.config.credentials),
        )
        .await
        .map_err(at(Stage::Dump))?;

        let artifact = if self.config.compressed {
            compress_backup(&raw).await.map_err(at(Stage::Compress))?
        } else {
            raw
        };

        let key = object_key(&artifact).map_err(at(Stage::Transfer))?;
        self.storage
            .upload(&artifact, &key)
            .await
            .map_err(at(Stage::Transfer))?;
        Ok(key)
    }
}

/// Remote object key: the artifact's file name
fn object_key(artifact: &Path) -> Result<String, BackupError> {
    artifact
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            BackupError::UploadFailed(format!("no usable file name in {}", artifact.display()))
        })
}
