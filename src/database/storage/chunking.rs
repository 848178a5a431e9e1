//! Chunked multipart transfer
//!
//! A file is split into contiguous byte ranges, each uploaded as one part of
//! a multipart session. The session is completed only when every part
//! succeeded, otherwise it is aborted so no object becomes visible.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{error, info, warn};

use crate::database::{BackupError, Result};

/// Largest chunk sent in a single part (100 MiB)
pub const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// One byte range of a multipart transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferChunk {
    pub offset: u64,
    pub length: u64,
    /// 1-indexed
    pub part_number: u32,
}

/// Partition `[0, file_size)` into chunks of at most `chunk_size` bytes
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<TransferChunk> {
    let chunk_size = chunk_size.max(1);
    let chunk_count = file_size.div_ceil(chunk_size);

    (0..chunk_count)
        .map(|i| {
            let offset = chunk_size * i;
            TransferChunk {
                offset,
                length: chunk_size.min(file_size - offset),
                part_number: (i + 1) as u32,
            }
        })
        .collect()
}

/// A part accepted by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    pub e_tag: String,
}

/// Multipart primitives offered by a provider
#[async_trait]
pub trait MultipartClient: Send + Sync {
    /// Open a session and return its upload id
    async fn create_multipart(&self, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<UploadedPart>;

    /// Commit the session; `parts` are sorted by part number
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Uploads files through a [`MultipartClient`] in bounded chunks
pub struct ChunkedUploader<C> {
    client: C,
    chunk_size: u64,
    concurrency: usize,
}

impl<C: MultipartClient> ChunkedUploader<C> {
    pub fn new(client: C, chunk_size: u64, concurrency: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Upload `file_path` as `key`; the object is committed or nothing is
    pub async fn upload(&self, file_path: &Path, key: &str) -> Result<()> {
        let file_size = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| {
                BackupError::UploadFailed(format!("cannot stat {}: {}", file_path.display(), e))
            })?
            .len();

        let mut chunks = plan_chunks(file_size, self.chunk_size);
        if chunks.is_empty() {
            // A multipart session needs at least one part.
            chunks.push(TransferChunk {
                offset: 0,
                length: 0,
                part_number: 1,
            });
        }

        let upload_id = self
            .client
            .create_multipart(key)
            .await
            .map_err(upload_failed)?;

        let committed = async {
            let parts = self.upload_chunks(file_path, key, &upload_id, &chunks).await?;
            self.client.complete_multipart(key, &upload_id, parts).await
        }
        .await;

        if let Err(e) = committed {
            error!("Multipart upload of {} failed: {}", key, e);
            if let Err(abort_err) = self.client.abort_multipart(key, &upload_id).await {
                warn!("Aborting multipart upload {} failed: {}", upload_id, abort_err);
            }
            return Err(upload_failed(e));
        }

        Ok(())
    }

    async fn upload_chunks(
        &self,
        file_path: &Path,
        key: &str,
        upload_id: &str,
        chunks: &[TransferChunk],
    ) -> Result<Vec<UploadedPart>> {
        let chunk_count = chunks.len();

        // try_collect stops at the first error and drops the in-flight parts.
        let mut parts: Vec<UploadedPart> = stream::iter(chunks.iter().copied())
            .map(|chunk| async move {
                let body = read_chunk(file_path, chunk).await?;
                info!("Upload chunk {}/{}", chunk.part_number, chunk_count);
                self.client
                    .upload_part(key, upload_id, chunk.part_number, body)
                    .await
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }
}

async fn read_chunk(file_path: &Path, chunk: TransferChunk) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(file_path).await?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;

    let mut body = vec![0u8; chunk.length as usize];
    file.read_exact(&mut body).await?;
    Ok(body)
}

fn upload_failed(error: BackupError) -> BackupError {
    match error {
        BackupError::UploadFailed(_) => error,
        other => BackupError::UploadFailed(other.to_string()),
    }
}
