use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types::byte_stream::ByteStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::config::S3Config;

#[derive(Debug, Error)]
pub enum BlobStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Upload error: {0}")]
    Upload(String),
    #[error("Presign error: {0}")]
    Presign(String),
    #[error("Head error: {0}")]
    Head(String),
    #[error("Delete error: {0}")]
    Delete(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type BlobStorageResult<T> = Result<T, BlobStorageError>;

/// Result of a completed upload.
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub key: String,
    pub bytes_written: u64,
    pub etag: Option<String>,
}

/// Service trait for abstracting durable object storage.
///
/// The generators depend on exactly two capabilities: a streamed upload that
/// never buffers the whole object, and time-limited download URLs carrying a
/// suggested filename.
#[async_trait]
pub trait BlobStorageService: Send + Sync {
    /// Upload everything the reader yields under the given key. Returns only
    /// after the object is durably stored.
    async fn upload_stream(
        &self,
        key: &str,
        content_type: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> BlobStorageResult<UploadSummary>;

    /// Generate a presigned, time-limited GET URL. The browser receives the
    /// given filename through a content-disposition hint.
    async fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
        download_file_name: &str,
    ) -> BlobStorageResult<String>;

    /// Size of a stored object in bytes.
    async fn head(&self, key: &str) -> BlobStorageResult<u64>;

    /// Remove a stored object.
    async fn delete(&self, key: &str) -> BlobStorageResult<()>;
}

/// Strips characters that would break the content-disposition header.
fn sanitize_file_name(name: &str) -> String {
    name.replace(['\r', '\n', '"'], "_")
}

// --- S3 implementation ---

/// Multipart part size. S3 requires at least 5 MiB for all but the last part.
const PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3BlobStorage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStorage {
    /// Build a client from explicit credentials and endpoint settings.
    pub async fn new(config: &S3Config) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "class-reports",
            ))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(config.endpoint.clone())
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            log::error!(
                "Failed to abort multipart upload {} for key {}: {}",
                upload_id,
                key,
                e
            );
        }
    }
}

#[async_trait]
impl BlobStorageService for S3BlobStorage {
    async fn upload_stream(
        &self,
        key: &str,
        content_type: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> BlobStorageResult<UploadSummary> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobStorageError::Upload(e.into_service_error().to_string()))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BlobStorageError::Upload("missing multipart upload id".to_string()))?
            .to_string();

        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut part_number: i32 = 0;
        let mut bytes_written: u64 = 0;
        let mut buffer = Vec::with_capacity(PART_SIZE);
        let mut chunk = vec![0u8; 64 * 1024];
        let mut eof = false;

        // Accumulate one part at a time so memory stays bounded by the part
        // size, regardless of object size.
        while !eof {
            while buffer.len() < PART_SIZE {
                let read = match reader.read(&mut chunk).await {
                    Ok(n) => n,
                    Err(e) => {
                        self.abort_upload(key, &upload_id).await;
                        return Err(BlobStorageError::Io(e));
                    }
                };
                if read == 0 {
                    eof = true;
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
            }

            // S3 requires at least one part, even for an empty object.
            if buffer.is_empty() && part_number > 0 {
                break;
            }

            part_number += 1;
            bytes_written += buffer.len() as u64;
            let body = ByteStream::from(std::mem::take(&mut buffer));
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await;
            match uploaded {
                Ok(part) => {
                    parts.push(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .e_tag(part.e_tag().unwrap_or_default())
                            .build(),
                    );
                }
                Err(e) => {
                    self.abort_upload(key, &upload_id).await;
                    return Err(BlobStorageError::Upload(e.into_service_error().to_string()));
                }
            }
            buffer = Vec::with_capacity(PART_SIZE);
        }

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await;
        match completed {
            Ok(out) => Ok(UploadSummary {
                key: key.to_string(),
                bytes_written,
                etag: out.e_tag().map(|s| s.to_string()),
            }),
            Err(e) => {
                self.abort_upload(key, &upload_id).await;
                Err(BlobStorageError::Upload(e.into_service_error().to_string()))
            }
        }
    }

    async fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
        download_file_name: &str,
    ) -> BlobStorageResult<String> {
        let presign_config = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|e| BlobStorageError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .response_content_disposition(format!(
                "attachment; filename=\"{}\"",
                sanitize_file_name(download_file_name)
            ))
            .presigned(presign_config)
            .await
            .map_err(|e| BlobStorageError::Presign(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn head(&self, key: &str) -> BlobStorageResult<u64> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_not_found() {
                    BlobStorageError::NotFound(key.to_string())
                } else {
                    BlobStorageError::Head(err.to_string())
                }
            })?;
        Ok(out.content_length().unwrap_or(0) as u64)
    }

    async fn delete(&self, key: &str) -> BlobStorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobStorageError::Delete(e.into_service_error().to_string()))?;
        Ok(())
    }
}

// --- In-memory implementation ---

#[derive(Debug, Clone)]
struct StoredObject {
    content_type: String,
    bytes: Vec<u8>,
}

/// HashMap-backed store for tests and local single-process runs.
#[derive(Default)]
pub struct InMemoryBlobStorage {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl InMemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes, for assertions.
    pub async fn object_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).map(|o| o.bytes.clone())
    }

    pub async fn object_content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl BlobStorageService for InMemoryBlobStorage {
    async fn upload_stream(
        &self,
        key: &str,
        content_type: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> BlobStorageResult<UploadSummary> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        let bytes_written = bytes.len() as u64;

        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                bytes,
            },
        );

        Ok(UploadSummary {
            key: key.to_string(),
            bytes_written,
            etag: None,
        })
    }

    async fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
        download_file_name: &str,
    ) -> BlobStorageResult<String> {
        // Unlike S3, the in-memory store can verify existence here, which
        // catches completed requests whose object is missing.
        if !self.objects.lock().await.contains_key(key) {
            return Err(BlobStorageError::NotFound(key.to_string()));
        }
        Ok(format!(
            "memory:///{}?expires={}&filename={}",
            key,
            ttl.as_secs(),
            sanitize_file_name(download_file_name)
        ))
    }

    async fn head(&self, key: &str) -> BlobStorageResult<u64> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.bytes.len() as u64)
            .ok_or_else(|| BlobStorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> BlobStorageResult<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}
