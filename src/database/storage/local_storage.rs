//! Local filesystem implementation of the StorageProvider trait
//!
//! Ships artifacts into `{local_root}/{bucket}/`, typically a mounted
//! network share. Also handy for dry runs of the whole pipeline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs as tokio_fs;
use tracing::{debug, info, warn};

use super::{RemoteArtifactRecord, StorageProvider};
use crate::config::StorageConfig;
use crate::database::{BackupError, Result};

/// Provides local filesystem storage for database backups
pub struct LocalStorageProvider {
    bucket: String,
    /// Directory standing in for the bucket
    bucket_dir: PathBuf,
}

impl LocalStorageProvider {
    /// Create a new LocalStorageProvider with the given configuration
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            bucket_dir: config.local_root.join(&config.bucket),
        }
    }

    #[cfg(test)]
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, artifact: &Path, key: &str) -> Result<()> {
        info!(
            "Copying backup at \"{}\" to \"{}\"",
            artifact.display(),
            self.bucket_dir.display()
        );

        // Copy under a temporary name so a partial copy is never listed.
        let partial = self.bucket_dir.join(format!(".{}.partial", key));
        let copy = async {
            tokio_fs::create_dir_all(&self.bucket_dir).await?;
            tokio_fs::copy(artifact, &partial).await?;
            tokio_fs::rename(&partial, self.bucket_dir.join(key)).await?;
            Ok::<_, std::io::Error>(())
        };

        if let Err(e) = copy.await {
            if let Err(remove_err) = tokio_fs::remove_file(&partial).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", partial.display(), remove_err);
                }
            }
            return Err(BackupError::UploadFailed(format!(
                "{}: {}",
                artifact.display(),
                e
            )));
        }
        info!("Upload successful");
        Ok(())
    }

    async fn list_objects(&self) -> Result<Vec<RemoteArtifactRecord>> {
        if !self.bucket_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio_fs::read_dir(&self.bucket_dir)
            .await
            .map_err(|e| BackupError::Storage(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::Storage(e.to_string()))?
        {
            let Ok(key) = entry.file_name().into_string() else {
                continue;
            };
            if key.starts_with('.') {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| BackupError::Storage(e.to_string()))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map_err(|e| BackupError::Storage(e.to_string()))?;
            records.push(RemoteArtifactRecord::new(key, DateTime::<Utc>::from(modified)));
        }

        debug!("Found {} objects in {}", records.len(), self.bucket_dir.display());
        Ok(records)
    }
}
