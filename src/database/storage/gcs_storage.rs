//! Google Cloud Storage implementation of the StorageProvider trait
//!
//! Talks to the GCS JSON API directly. Objects are uploaded in a single
//! media request; listings are paged through `nextPageToken`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use super::{RemoteArtifactRecord, StorageProvider};
use crate::config::StorageConfig;
use crate::database::{BackupError, Result};

/// How requests are authorized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcsAuth {
    /// A pre-issued OAuth2 bearer token
    Token(String),
    /// Fetch a service-account token from the instance metadata server
    MetadataServer { endpoint: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<GcsObject>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    updated: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

/// Provides Google Cloud Storage for database backups
pub struct GcsStorageProvider {
    http: reqwest::Client,
    bucket: String,
    endpoint: String,
    auth: GcsAuth,
}

impl GcsStorageProvider {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let auth = match &config.gcs_token {
            Some(token) => GcsAuth::Token(token.clone()),
            None => GcsAuth::MetadataServer {
                endpoint: config.gcs_token_endpoint.clone(),
            },
        };
        Self::with_endpoint(&config.bucket, &config.gcs_endpoint, auth)
    }

    pub fn with_endpoint(bucket: &str, endpoint: &str, auth: GcsAuth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("edx-backups/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackupError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            bucket: bucket.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth,
        })
    }

    async fn access_token(&self) -> Result<String> {
        match &self.auth {
            GcsAuth::Token(token) => Ok(token.clone()),
            GcsAuth::MetadataServer { endpoint } => {
                let token: MetadataToken = self
                    .http
                    .get(endpoint)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| gcs_error("fetching an access token", e))?
                    .json()
                    .await
                    .map_err(|e| gcs_error("decoding the access token", e))?;
                Ok(token.access_token)
            }
        }
    }

    fn objects_url(&self) -> String {
        format!("{}/storage/v1/b/{}/o", self.endpoint, self.bucket)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/storage/v1/b/{}/o", self.endpoint, self.bucket)
    }
}

fn gcs_error(operation: &str, error: reqwest::Error) -> BackupError {
    BackupError::Storage(format!("GCS error while {}: {}", operation, error))
}

#[async_trait]
impl StorageProvider for GcsStorageProvider {
    fn name(&self) -> &'static str {
        "gs"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, artifact: &Path, key: &str) -> Result<()> {
        info!(
            "Uploading backup at \"{}\" to Google Cloud Storage bucket \"{}\"",
            artifact.display(),
            self.bucket
        );

        let upload = async {
            let token = self.access_token().await?;
            let file = tokio::fs::File::open(artifact).await?;
            let size = file.metadata().await?.len();

            self.http
                .post(self.upload_url())
                .query(&[("uploadType", "media"), ("name", key)])
                .bearer_auth(token)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, size)
                .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| gcs_error("uploading", e))?;
            Ok::<_, BackupError>(())
        };

        upload.await.map_err(|e| {
            error!("Failed to upload backup to GCS: {}", e);
            BackupError::UploadFailed(e.to_string())
        })?;

        info!("Upload successful");
        Ok(())
    }

    async fn list_objects(&self) -> Result<Vec<RemoteArtifactRecord>> {
        debug!("Listing objects in GCS bucket {}", self.bucket);
        let token = self.access_token().await?;

        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(self.objects_url())
                .bearer_auth(&token)
                .query(&[("fields", "items(name,updated),nextPageToken")]);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page)]);
            }

            let page: ObjectList = request
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| gcs_error("listing objects", e))?
                .json()
                .await
                .map_err(|e| gcs_error("decoding the object listing", e))?;

            records.extend(
                page.items
                    .into_iter()
                    .map(|object| RemoteArtifactRecord::new(object.name, object.updated)),
            );

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!("Found {} objects in GCS", records.len());
        Ok(records)
    }
}
