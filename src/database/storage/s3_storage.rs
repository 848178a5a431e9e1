//! AWS S3 implementation of the StorageProvider trait
//!
//! Uploads go through the multipart API in bounded chunks so large dumps
//! never have to be held in memory at once.

use std::path::Path;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_types::region::Region;
use chrono::DateTime;
use tracing::{debug, error, info};

use super::chunking::{ChunkedUploader, MultipartClient, UploadedPart};
use super::{RemoteArtifactRecord, StorageProvider};
use crate::config::StorageConfig;
use crate::database::{BackupError, Result};

/// Multipart primitives of one S3 bucket
#[derive(Clone)]
pub struct S3MultipartClient {
    client: S3Client,
    bucket: String,
}

/// Provides AWS S3 storage for database backups
pub struct S3StorageProvider {
    /// S3 client
    client: S3Client,
    /// S3 bucket name
    bucket: String,
    uploader: ChunkedUploader<S3MultipartClient>,
}

impl S3StorageProvider {
    /// Create a new S3StorageProvider with the given configuration
    ///
    /// Static credentials are used when both key halves are configured,
    /// otherwise the default AWS credential chain applies.
    pub async fn new(config: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.s3_region.clone()));

        if let (Some(id), Some(secret)) = (&config.s3_access_key_id, &config.s3_secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "Static",
            ));
        }
        if let Some(endpoint) = &config.s3_endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        Self::from_client(
            S3Client::new(&sdk_config),
            &config.bucket,
            config.chunk_size,
            config.upload_concurrency,
        )
    }

    pub fn from_client(client: S3Client, bucket: &str, chunk_size: u64, concurrency: usize) -> Self {
        let multipart = S3MultipartClient {
            client: client.clone(),
            bucket: bucket.to_string(),
        };
        Self {
            client,
            bucket: bucket.to_string(),
            uploader: ChunkedUploader::new(multipart, chunk_size, concurrency),
        }
    }
}

/// Map AWS S3 errors to BackupError
fn map_s3_error<E>(error: SdkError<E>, operation: &str) -> BackupError
where
    E: std::error::Error + 'static,
{
    let category = match &error {
        SdkError::ConstructionFailure(_) => "client construction error",
        SdkError::TimeoutError(_) => "timeout",
        SdkError::DispatchFailure(_) => "dispatch error",
        SdkError::ResponseError(_) => "response error",
        SdkError::ServiceError(_) => "service error",
        _ => "unknown error",
    };
    BackupError::Storage(format!(
        "S3 {} during {}: {}",
        category,
        operation,
        DisplayErrorContext(&error)
    ))
}

#[async_trait]
impl MultipartClient for S3MultipartClient {
    async fn create_multipart(&self, key: &str) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error(e, "create_multipart_upload"))?;

        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| BackupError::Storage("S3 returned no upload id".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<UploadedPart> {
        let part = i32::try_from(part_number)
            .map_err(|_| BackupError::Storage(format!("part number {} out of range", part_number)))?;
        let length = body.len() as i64;

        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part)
            .content_length(length)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_s3_error(e, "upload_part"))?;

        debug!("Uploaded part {} of {} ({} bytes)", part_number, key, length);
        Ok(UploadedPart {
            part_number,
            e_tag: resp.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let completed: Vec<CompletedPart> = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(part.e_tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_s3_error(e, "complete_multipart_upload"))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_s3_error(e, "abort_multipart_upload"))?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for S3StorageProvider {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, artifact: &Path, key: &str) -> Result<()> {
        info!(
            "Uploading backup at \"{}\" to Amazon S3 bucket \"{}\"",
            artifact.display(),
            self.bucket
        );
        self.uploader.upload(artifact, key).await.inspect_err(|e| {
            error!("Failed to upload backup to S3: {}", e);
        })?;
        info!("Upload successful");
        Ok(())
    }

    async fn list_objects(&self) -> Result<Vec<RemoteArtifactRecord>> {
        debug!("Listing objects in S3 bucket {}", self.bucket);

        let mut records = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_s3_error(e, "list_objects_v2"))?;

            for object in resp.contents() {
                let (Some(key), Some(modified)) = (object.key(), object.last_modified()) else {
                    continue;
                };
                if let Some(last_modified) =
                    DateTime::from_timestamp(modified.secs(), modified.subsec_nanos())
                {
                    records.push(RemoteArtifactRecord::new(key, last_modified));
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!("Found {} objects in S3", records.len());
        Ok(records)
    }
}
