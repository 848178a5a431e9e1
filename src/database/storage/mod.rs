//! Storage module for shipping backups to remote object storage
//!
//! This module provides an abstraction layer over the object stores the
//! backups are shipped to. The pipelines only see [`StorageProvider`]; the
//! concrete backend is picked from configuration at runtime, so a new
//! provider is added here without touching the dump, compress or cleanup
//! stages.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{ProviderKind, StorageConfig};
use crate::database::{BackupError, Result};

pub mod chunking;
pub mod gcs_storage;
pub mod local_storage;
pub mod s3_storage;

/// An object as reported by a provider listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifactRecord {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

impl RemoteArtifactRecord {
    pub fn new(key: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            last_modified,
        }
    }
}

/// Provides a unified interface over remote backup storage
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short provider name used in logs and alert tags
    fn name(&self) -> &'static str;

    /// Bucket the provider reads from and writes to
    fn bucket(&self) -> &str;

    /// Store a local artifact under `key`
    ///
    /// Either the whole object is committed or the call fails with
    /// [`BackupError::UploadFailed`].
    async fn upload(&self, artifact: &Path, key: &str) -> Result<()>;

    /// List every object in the bucket, in no particular order
    async fn list_objects(&self) -> Result<Vec<RemoteArtifactRecord>>;
}

/// Create the storage provider selected by the configuration
pub async fn create_storage_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
    if config.bucket.trim().is_empty() {
        return Err(BackupError::Config(format!(
            "a bucket name is required for the {} provider",
            config.provider.as_str()
        )));
    }

    info!(
        "Using {} storage provider with bucket \"{}\"",
        config.provider.as_str(),
        config.bucket
    );

    let provider: Arc<dyn StorageProvider> = match config.provider {
        ProviderKind::Gs => Arc::new(gcs_storage::GcsStorageProvider::new(config)?),
        ProviderKind::S3 => Arc::new(s3_storage::S3StorageProvider::new(config).await),
        ProviderKind::Local => Arc::new(local_storage::LocalStorageProvider::new(config)),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_bucket_is_a_config_error() {
        let config = StorageConfig::default();
        let err = create_storage_provider(&config).await.err().unwrap();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[tokio::test]
    async fn test_provider_follows_configuration() {
        let dir = tempfile::tempdir().unwrap();

        let local = StorageConfig {
            provider: ProviderKind::Local,
            bucket: "nightly".to_string(),
            local_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let provider = create_storage_provider(&local).await.unwrap();
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.bucket(), "nightly");

        let gs = StorageConfig {
            provider: ProviderKind::Gs,
            bucket: "nightly".to_string(),
            gcs_token: Some("token".to_string()),
            ..Default::default()
        };
        let provider = create_storage_provider(&gs).await.unwrap();
        assert_eq!(provider.name(), "gs");
    }
}
