pub mod pdf;
pub mod xlsx;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::domains::core::blob_storage_service::{BlobStorageService, UploadSummary};
use crate::domains::participation::ParticipationRepository;
use crate::errors::DomainError;

use super::types::ReportKind;

pub use pdf::TabularPdfGenerator;
pub use xlsx::TabularXlsxGenerator;

/// Failure while building or storing a document.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Row query failed: {0}")]
    Query(#[from] DomainError),

    #[error("Document rendering failed: {0}")]
    Render(String),

    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Consumes the participation row stream for one class and leaves a
/// finished document in the blob store under the given key.
///
/// Success implies the bytes are durably stored. Implementations must
/// release the row cursor on every exit path and never materialize the row
/// set.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    fn kind(&self) -> ReportKind;

    async fn generate(&self, class_id: &str, object_key: &str) -> Result<(), GenerationError>;
}

/// One generator per report kind, constructed once and shared by the
/// worker pool.
pub struct GeneratorRegistry {
    pdf: Arc<dyn ReportGenerator>,
    xlsx: Arc<dyn ReportGenerator>,
}

impl GeneratorRegistry {
    pub fn new(
        participation: Arc<dyn ParticipationRepository>,
        storage: Arc<dyn BlobStorageService>,
    ) -> Self {
        Self {
            pdf: Arc::new(TabularPdfGenerator::new(
                participation.clone(),
                storage.clone(),
            )),
            xlsx: Arc::new(TabularXlsxGenerator::new(participation, storage)),
        }
    }

    pub fn for_kind(&self, kind: ReportKind) -> Arc<dyn ReportGenerator> {
        match kind {
            ReportKind::TabularPdf => self.pdf.clone(),
            ReportKind::TabularXlsx => self.xlsx.clone(),
        }
    }
}

/// Pipe rendered document bytes into a streamed upload and join the upload
/// before returning, chunk by chunk through a bounded duplex buffer.
pub(crate) async fn upload_rendered(
    storage: Arc<dyn BlobStorageService>,
    object_key: &str,
    content_type: &'static str,
    bytes: Vec<u8>,
) -> Result<UploadSummary, GenerationError> {
    let (reader, mut writer) = tokio::io::duplex(64 * 1024);

    let key = object_key.to_string();
    let upload = tokio::spawn(async move {
        storage
            .upload_stream(&key, content_type, Box::new(reader))
            .await
    });

    // A write error here means the uploader hung up. The join below
    // surfaces the underlying storage error, so the write result is only
    // used to stop early.
    for chunk in bytes.chunks(64 * 1024) {
        if writer.write_all(chunk).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    drop(writer);

    match upload.await {
        Ok(Ok(summary)) => Ok(summary),
        Ok(Err(e)) => Err(GenerationError::Upload(e.to_string())),
        Err(e) => Err(GenerationError::Upload(format!("upload task failed: {}", e))),
    }
}

/// Shorten a value so it stays inside a fixed-width table column.
pub(crate) fn fit_column(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let prefix: String = value.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}\u{2026}", prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::blob_storage_service::InMemoryBlobStorage;

    #[test]
    fn test_fit_column() {
        assert_eq!(fit_column("short", 10), "short");
        assert_eq!(fit_column("a very long student name", 10), "a very lo\u{2026}");
    }

    #[tokio::test]
    async fn test_upload_rendered_stores_all_bytes() {
        let storage = Arc::new(InMemoryBlobStorage::new());
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();

        let summary = upload_rendered(
            storage.clone(),
            "reports/blob.bin",
            "application/octet-stream",
            payload.clone(),
        )
        .await
        .unwrap();

        assert_eq!(summary.bytes_written, payload.len() as u64);
        assert_eq!(storage.object_bytes("reports/blob.bin").await.unwrap(), payload);
    }
}
