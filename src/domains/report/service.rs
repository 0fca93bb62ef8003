use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::domains::core::blob_storage_service::BlobStorageService;
use crate::domains::participation::ParticipationRepository;
use crate::errors::{DomainError, ServiceError, ServiceResult, ValidationError};
use crate::queue::WorkQueue;

use super::repository::ReportRequestRepository;
use super::types::{
    NewReportRequest, ReportJob, ReportRequestSummary, ReportStatus, ReportStatusView,
};

/// Default lifetime of a presigned download URL.
const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(300);

/// Request intake and the status/download query surface.
///
/// Submission only persists a `Pending` row and enqueues a job. All
/// generation work happens on the worker side; callers learn the outcome by
/// polling [`get_status`](Self::get_status).
pub struct ReportService {
    repo: Arc<dyn ReportRequestRepository>,
    participation: Arc<dyn ParticipationRepository>,
    queue: Arc<dyn WorkQueue>,
    blob_storage: Arc<dyn BlobStorageService>,
    download_url_ttl: Duration,
}

impl ReportService {
    pub fn new(
        repo: Arc<dyn ReportRequestRepository>,
        participation: Arc<dyn ParticipationRepository>,
        queue: Arc<dyn WorkQueue>,
        blob_storage: Arc<dyn BlobStorageService>,
    ) -> Self {
        Self {
            repo,
            participation,
            queue,
            blob_storage,
            download_url_ttl: DOWNLOAD_URL_TTL,
        }
    }

    pub fn with_download_url_ttl(mut self, ttl: Duration) -> Self {
        self.download_url_ttl = ttl;
        self
    }

    /// Validate and persist a report request, then hand it to the work
    /// queue. Returns the request id for status polling.
    ///
    /// A class without participation rows is rejected as a validation
    /// error: the class may well exist, there is just nothing to report.
    pub async fn submit(&self, input: NewReportRequest) -> ServiceResult<Uuid> {
        if input.class_id.trim().is_empty() {
            return Err(DomainError::Validation(ValidationError::required("class_id")).into());
        }
        if input.report_kind.trim().is_empty() {
            return Err(DomainError::Validation(ValidationError::required("report_kind")).into());
        }

        let has_rows = self.participation.class_has_rows(&input.class_id).await?;
        if !has_rows {
            return Err(DomainError::Validation(ValidationError::custom(format!(
                "class {} has no participation data to report",
                input.class_id
            )))
            .into());
        }

        let request = self.repo.create_request(&input).await?;
        log::info!(
            "Created report request {} for class {} ({})",
            request.id,
            request.class_id,
            request.report_kind
        );

        let job = ReportJob {
            request_id: request.id,
            class_id: request.class_id.clone(),
            report_kind: request.report_kind.clone(),
        };
        if let Err(e) = self.queue.enqueue(&job).await {
            // The row is already durable, so a silent Pending orphan is the
            // one outcome we must avoid: fail the request and surface the
            // error to the caller, who may submit again.
            log::error!("Enqueue failed for report request {}: {}", request.id, e);
            self.repo
                .update_status(
                    request.id,
                    ReportStatus::Failed,
                    Some(format!("could not enqueue generation job: {}", e)),
                )
                .await?;
            return Err(ServiceError::ServiceUnavailable(format!(
                "report queue unavailable: {}",
                e
            )));
        }

        Ok(request.id)
    }

    /// Current lifecycle state of a request. Never mutates anything.
    pub async fn get_status(&self, request_id: Uuid) -> ServiceResult<ReportStatusView> {
        let request = self.repo.find_by_id(request_id).await?;
        Ok(ReportStatusView {
            status: request.status,
            error_detail: request.error_detail,
        })
    }

    /// Presigned download URL for a completed request.
    ///
    /// Requests in any other state are a validation error naming the
    /// current status. A completed request without an artifact row means
    /// the completion invariant was broken and is reported as an internal
    /// error.
    pub async fn get_download_url(&self, request_id: Uuid) -> ServiceResult<String> {
        let request = self.repo.find_by_id(request_id).await?;

        if request.status != ReportStatus::Completed {
            return Err(DomainError::Validation(ValidationError::custom(format!(
                "report is not ready yet (current status: {})",
                request.status
            )))
            .into());
        }

        let Some(artifact) = self.repo.find_artifact(request_id).await? else {
            log::error!(
                "Report request {} is completed but has no artifact row",
                request_id
            );
            return Err(DomainError::Internal(format!(
                "completed report request {} has no stored artifact",
                request_id
            ))
            .into());
        };

        let url = self
            .blob_storage
            .presign_get(
                &artifact.object_key,
                self.download_url_ttl,
                &artifact.file_name,
            )
            .await
            .map_err(|e| ServiceError::ExternalService(format!("presign failed: {}", e)))?;
        Ok(url)
    }

    /// Latest requests, newest first.
    pub async fn list_recent(&self, limit: i64) -> ServiceResult<Vec<ReportRequestSummary>> {
        Ok(self.repo.list_recent(limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;
    use crate::domains::core::blob_storage_service::{BlobStorageService, InMemoryBlobStorage};
    use crate::domains::participation::repository::seed_participation;
    use crate::domains::participation::SqliteParticipationRepository;
    use crate::domains::report::repository::SqliteReportRequestRepository;
    use crate::domains::report::types::GeneratedReport;
    use crate::queue::{InMemoryWorkQueue, RetryPolicy};

    struct TestEnv {
        service: ReportService,
        repo: Arc<SqliteReportRequestRepository>,
        queue: Arc<InMemoryWorkQueue>,
        storage: Arc<InMemoryBlobStorage>,
        pool: sqlx::SqlitePool,
    }

    async fn env() -> TestEnv {
        let pool = test_pool().await;
        let repo = Arc::new(SqliteReportRequestRepository::new(pool.clone()));
        let queue = Arc::new(InMemoryWorkQueue::new(RetryPolicy::default()));
        let storage = Arc::new(InMemoryBlobStorage::new());
        let service = ReportService::new(
            repo.clone(),
            Arc::new(SqliteParticipationRepository::new(pool.clone())),
            queue.clone(),
            storage.clone(),
        );
        TestEnv {
            service,
            repo,
            queue,
            storage,
            pool,
        }
    }

    fn request(class_id: &str, kind: &str) -> NewReportRequest {
        NewReportRequest {
            class_id: class_id.to_string(),
            report_kind: kind.to_string(),
            file_name: None,
        }
    }

    #[tokio::test]
    async fn test_submit_creates_pending_request_and_enqueues() {
        let env = env().await;
        seed_participation(&env.pool, "class-42", &[("Alice", "Robotics")]).await;

        let id = env
            .service
            .submit(request("class-42", "tabular-pdf"))
            .await
            .unwrap();

        // Immediately after submit the caller sees Pending, never a
        // terminal state.
        let view = env.service.get_status(id).await.unwrap();
        assert_eq!(view.status, ReportStatus::Pending);
        assert!(view.error_detail.is_none());
        assert_eq!(env.queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_submit_requires_fields() {
        let env = env().await;
        let err = env.service.submit(request("", "tabular-pdf")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::Validation(_))
        ));

        let err = env.service.submit(request("class-1", " ")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_class_without_rows() {
        let env = env().await;
        let err = env
            .service
            .submit(request("class-without-data", "tabular-pdf"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::Validation(_))
        ));

        // No request row may be left behind.
        assert!(env.repo.list_recent(10).await.unwrap().is_empty());
        assert_eq!(env.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_get_status_unknown_id_is_not_found() {
        let env = env().await;
        let err = env.service.get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::EntityNotFound(_, _))
        ));
    }

    #[tokio::test]
    async fn test_download_url_requires_completed_status() {
        let env = env().await;
        seed_participation(&env.pool, "class-1", &[("Alice", "Robotics")]).await;
        let id = env
            .service
            .submit(request("class-1", "tabular-pdf"))
            .await
            .unwrap();

        let err = env.service.get_download_url(id).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("pending"), "message was: {}", message);
    }

    #[tokio::test]
    async fn test_download_url_for_completed_request() {
        let env = env().await;
        seed_participation(&env.pool, "class-1", &[("Alice", "Robotics")]).await;
        let id = env
            .service
            .submit(request("class-1", "tabular-pdf"))
            .await
            .unwrap();

        let object_key = format!("reports/{}.pdf", id);
        env.storage
            .upload_stream(
                &object_key,
                "application/pdf",
                Box::new(std::io::Cursor::new(b"%PDF-1.3 stub".to_vec())),
            )
            .await
            .unwrap();
        env.repo
            .complete_with_artifact(&GeneratedReport {
                request_id: id,
                class_id: "class-1".to_string(),
                report_kind: "tabular-pdf".to_string(),
                file_name: "class_class-1_report.pdf".to_string(),
                object_key: object_key.clone(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let url = env.service.get_download_url(id).await.unwrap();
        assert!(url.contains(&object_key));
    }

    #[tokio::test]
    async fn test_completed_without_artifact_is_internal_error() {
        let env = env().await;
        seed_participation(&env.pool, "class-1", &[("Alice", "Robotics")]).await;
        let id = env
            .service
            .submit(request("class-1", "tabular-pdf"))
            .await
            .unwrap();

        // Force the status forward without an artifact row, breaking the
        // completion invariant on purpose.
        sqlx::query("UPDATE report_requests SET status = 'completed' WHERE id = ?")
            .bind(id.to_string())
            .execute(&env.pool)
            .await
            .unwrap();

        let err = env.service.get_download_url(id).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::Internal(_))
        ));
    }
}
