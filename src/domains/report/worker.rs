use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, Semaphore};

use crate::errors::{DomainError, ServiceResult};
use crate::queue::{Delivery, WorkQueue};

use super::generators::GeneratorRegistry;
use super::repository::ReportRequestRepository;
use super::types::{GeneratedReport, ReportKind, ReportStatus};

const DEFAULT_CONCURRENCY: usize = 3;
const QUEUE_POLL_WAIT: Duration = Duration::from_secs(5);

/// Consumer loop that drives queued report jobs to a terminal status.
///
/// Handlers are idempotent: the object key is re-derived from the request
/// id, the artifact write is an upsert, and requests already in a terminal
/// state are skipped. Redelivery after a crash mid-job is therefore safe.
pub struct ReportWorker {
    queue: Arc<dyn WorkQueue>,
    repo: Arc<dyn ReportRequestRepository>,
    generators: Arc<GeneratorRegistry>,
    concurrency: usize,
    poll_wait: Duration,
    shutdown_signal: Option<oneshot::Receiver<()>>,
}

impl ReportWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        repo: Arc<dyn ReportRequestRepository>,
        generators: Arc<GeneratorRegistry>,
    ) -> Self {
        Self {
            queue,
            repo,
            generators,
            concurrency: DEFAULT_CONCURRENCY,
            poll_wait: QUEUE_POLL_WAIT,
            shutdown_signal: None,
        }
    }

    /// Cap on concurrently processed jobs.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set shutdown signal receiver
    pub fn with_shutdown_signal(mut self, receiver: oneshot::Receiver<()>) -> Self {
        self.shutdown_signal = Some(receiver);
        self
    }

    /// Run until the shutdown signal fires. In-flight jobs are drained
    /// before returning.
    pub async fn run(mut self) -> ServiceResult<()> {
        log::info!(
            "Starting report worker (concurrency {})",
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut shutdown = self.shutdown_signal.take();

        loop {
            // Hold a pool slot before pulling work, so a delivery is never
            // claimed without capacity to process it.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    log::info!("Received shutdown signal, stopping report worker");
                    break;
                }
            };

            let delivery = tokio::select! {
                delivery = self.queue.next_delivery(self.poll_wait) => delivery,
                _ = wait_for_shutdown(&mut shutdown) => {
                    log::info!("Received shutdown signal, stopping report worker");
                    break;
                }
            };

            match delivery {
                Ok(Some(delivery)) => {
                    let queue = self.queue.clone();
                    let repo = self.repo.clone();
                    let generators = self.generators.clone();
                    tokio::spawn(async move {
                        process_delivery(queue, repo, generators, delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("Failed to read from work queue: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // Wait for spawned jobs to finish.
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        log::info!("Report worker stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(signal: &mut Option<oneshot::Receiver<()>>) {
    match signal {
        Some(receiver) => {
            let _ = receiver.await;
        }
        // Never complete if no shutdown signal was configured.
        None => std::future::pending::<()>().await,
    }
}

async fn process_delivery(
    queue: Arc<dyn WorkQueue>,
    repo: Arc<dyn ReportRequestRepository>,
    generators: Arc<GeneratorRegistry>,
    delivery: Delivery,
) {
    let job = delivery.job.clone();
    log::info!(
        "[job {}] Generating {} report for class {} (attempt {}/{})",
        job.request_id,
        job.report_kind,
        job.class_id,
        delivery.attempt,
        delivery.max_attempts
    );

    let request = match repo.find_by_id(job.request_id).await {
        Ok(request) => request,
        Err(DomainError::EntityNotFound(_, _)) => {
            log::warn!(
                "[job {}] No report request row for this job, discarding",
                job.request_id
            );
            ack_or_log(&queue, &delivery).await;
            return;
        }
        Err(e) => {
            log::error!("[job {}] Failed to load request: {}", job.request_id, e);
            nack_or_log(&queue, &delivery, &e.to_string()).await;
            return;
        }
    };

    // Terminal states are never left. A redelivery that lost the race with
    // another worker, or a retry of an already failed request, is a no-op.
    if request.status.is_terminal() {
        log::info!(
            "[job {}] Request already {}, skipping",
            job.request_id,
            request.status
        );
        ack_or_log(&queue, &delivery).await;
        return;
    }

    if let Err(e) = repo
        .update_status(job.request_id, ReportStatus::Processing, None)
        .await
    {
        log::error!(
            "[job {}] Failed to mark request processing: {}",
            job.request_id,
            e
        );
        nack_or_log(&queue, &delivery, &e.to_string()).await;
        return;
    }

    // An unknown report kind is a configuration error, not a transient
    // one. Fail the request immediately, with no retries.
    let kind = match job.report_kind.parse::<ReportKind>() {
        Ok(kind) => kind,
        Err(e) => {
            log::error!(
                "[job {}] Unsupported report kind '{}'",
                job.request_id,
                job.report_kind
            );
            fail_request(&repo, &delivery, &e.to_string()).await;
            ack_or_log(&queue, &delivery).await;
            return;
        }
    };

    // Deriving the key from the request id makes redelivered jobs
    // overwrite their own partial output instead of accumulating copies.
    let object_key = format!("reports/{}.{}", job.request_id, kind.file_extension());
    let file_name = request
        .file_name
        .clone()
        .unwrap_or_else(|| format!("class_{}_report.{}", job.class_id, kind.file_extension()));

    let generator = generators.for_kind(kind);
    match generator.generate(&job.class_id, &object_key).await {
        Ok(()) => {
            let artifact = GeneratedReport {
                request_id: job.request_id,
                class_id: job.class_id.clone(),
                report_kind: kind.as_str().to_string(),
                file_name,
                object_key,
                created_at: Utc::now(),
            };
            match repo.complete_with_artifact(&artifact).await {
                Ok(()) => {
                    log::info!("[job {}] Report generated successfully", job.request_id);
                    ack_or_log(&queue, &delivery).await;
                }
                Err(e) => {
                    // The upload succeeded but the status write did not.
                    // Redelivery regenerates under the same key and tries
                    // the write again.
                    log::error!(
                        "[job {}] Failed to record artifact: {}",
                        job.request_id,
                        e
                    );
                    if delivery.is_final_attempt() {
                        fail_request(&repo, &delivery, &e.to_string()).await;
                    }
                    nack_or_log(&queue, &delivery, &e.to_string()).await;
                }
            }
        }
        Err(e) => {
            let message = e.to_string();
            log::error!("[job {}] Generation failed: {}", job.request_id, message);
            // The request stays in Processing while retries remain; only
            // the exhausted attempt flips it to Failed.
            if delivery.is_final_attempt() {
                fail_request(&repo, &delivery, &message).await;
            }
            nack_or_log(&queue, &delivery, &message).await;
        }
    }
}

async fn fail_request(
    repo: &Arc<dyn ReportRequestRepository>,
    delivery: &Delivery,
    message: &str,
) {
    if let Err(e) = repo
        .update_status(
            delivery.job.request_id,
            ReportStatus::Failed,
            Some(message.to_string()),
        )
        .await
    {
        log::error!(
            "[job {}] Failed to mark request failed: {}",
            delivery.job.request_id,
            e
        );
    }
}

async fn ack_or_log(queue: &Arc<dyn WorkQueue>, delivery: &Delivery) {
    if let Err(e) = queue.ack(delivery).await {
        log::error!(
            "[job {}] Failed to ack delivery: {}",
            delivery.job.request_id,
            e
        );
    }
}

async fn nack_or_log(queue: &Arc<dyn WorkQueue>, delivery: &Delivery, reason: &str) {
    if let Err(e) = queue.nack(delivery, reason).await {
        log::error!(
            "[job {}] Failed to nack delivery: {}",
            delivery.job.request_id,
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::database::test_pool;
    use crate::domains::core::blob_storage_service::{
        BlobStorageError, BlobStorageResult, BlobStorageService, InMemoryBlobStorage,
        UploadSummary,
    };
    use crate::domains::participation::repository::seed_participation;
    use crate::domains::participation::SqliteParticipationRepository;
    use crate::domains::report::repository::SqliteReportRequestRepository;
    use crate::domains::report::service::ReportService;
    use crate::domains::report::types::{NewReportRequest, ReportJob};
    use crate::queue::{InMemoryWorkQueue, RetryPolicy};

    /// Blob store that fails the first N uploads, for retry scenarios.
    struct FlakyBlobStorage {
        inner: InMemoryBlobStorage,
        failures_left: AtomicU32,
    }

    impl FlakyBlobStorage {
        fn failing(failures: u32) -> Self {
            Self {
                inner: InMemoryBlobStorage::new(),
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl BlobStorageService for FlakyBlobStorage {
        async fn upload_stream(
            &self,
            key: &str,
            content_type: &str,
            reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        ) -> BlobStorageResult<UploadSummary> {
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(BlobStorageError::Upload("simulated upload outage".into()));
            }
            self.inner.upload_stream(key, content_type, reader).await
        }

        async fn presign_get(
            &self,
            key: &str,
            ttl: Duration,
            download_file_name: &str,
        ) -> BlobStorageResult<String> {
            self.inner.presign_get(key, ttl, download_file_name).await
        }

        async fn head(&self, key: &str) -> BlobStorageResult<u64> {
            self.inner.head(key).await
        }

        async fn delete(&self, key: &str) -> BlobStorageResult<()> {
            self.inner.delete(key).await
        }
    }

    struct TestEnv {
        pool: sqlx::SqlitePool,
        repo: Arc<SqliteReportRequestRepository>,
        queue: Arc<InMemoryWorkQueue>,
        service: ReportService,
        generators: Arc<GeneratorRegistry>,
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }

    async fn env_with_storage(storage: Arc<dyn BlobStorageService>) -> TestEnv {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = test_pool().await;
        let repo = Arc::new(SqliteReportRequestRepository::new(pool.clone()));
        let participation = Arc::new(SqliteParticipationRepository::new(pool.clone()));
        let queue = Arc::new(InMemoryWorkQueue::new(fast_policy()));
        let generators = Arc::new(GeneratorRegistry::new(
            participation.clone(),
            storage.clone(),
        ));
        let service = ReportService::new(
            repo.clone(),
            participation,
            queue.clone(),
            storage,
        );
        TestEnv {
            pool,
            repo,
            queue,
            service,
            generators,
        }
    }

    /// Run a worker until the request reaches a terminal state, then shut
    /// it down.
    async fn run_worker_until_terminal(env: &TestEnv, request_id: Uuid) -> ReportStatus {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = ReportWorker::new(
            env.queue.clone(),
            env.repo.clone(),
            env.generators.clone(),
        )
        .with_concurrency(2)
        .with_shutdown_signal(shutdown_rx);
        let handle = tokio::spawn(worker.run());

        let mut status = ReportStatus::Pending;
        for _ in 0..500 {
            status = env.repo.find_by_id(request_id).await.unwrap().status;
            if status.is_terminal() && env.queue.depth().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
        status
    }

    async fn submit(env: &TestEnv, class_id: &str, kind: &str) -> Uuid {
        env.service
            .submit(NewReportRequest {
                class_id: class_id.to_string(),
                report_kind: kind.to_string(),
                file_name: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_pdf_to_completed() {
        let storage = Arc::new(InMemoryBlobStorage::new());
        let env = env_with_storage(storage.clone()).await;
        seed_participation(&env.pool, "class-42", &[("Alice", "Robotics"), ("Bob", "Chess")])
            .await;

        let id = submit(&env, "class-42", "tabular-pdf").await;
        assert_eq!(
            env.repo.find_by_id(id).await.unwrap().status,
            ReportStatus::Pending
        );

        let status = run_worker_until_terminal(&env, id).await;
        assert_eq!(status, ReportStatus::Completed);

        let artifact = env.repo.find_artifact(id).await.unwrap().unwrap();
        assert_eq!(artifact.object_key, format!("reports/{}.pdf", id));
        let bytes = storage.object_bytes(&artifact.object_key).await.unwrap();
        assert!(bytes.starts_with(b"%PDF"));

        // Completed implies the download URL resolves.
        let url = env.service.get_download_url(id).await.unwrap();
        assert!(url.contains(&artifact.object_key));
    }

    #[tokio::test]
    async fn test_spreadsheet_kind_routes_to_xlsx_generator() {
        let storage = Arc::new(InMemoryBlobStorage::new());
        let env = env_with_storage(storage.clone()).await;
        seed_participation(&env.pool, "class-7", &[("Alice", "Robotics")]).await;

        let id = submit(&env, "class-7", "tabular-spreadsheet").await;
        let status = run_worker_until_terminal(&env, id).await;
        assert_eq!(status, ReportStatus::Completed);

        let artifact = env.repo.find_artifact(id).await.unwrap().unwrap();
        assert_eq!(artifact.object_key, format!("reports/{}.xlsx", id));
        assert_eq!(artifact.file_name, "class_class-7_report.xlsx");
        let bytes = storage.object_bytes(&artifact.object_key).await.unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_without_retry() {
        let env = env_with_storage(Arc::new(InMemoryBlobStorage::new())).await;
        seed_participation(&env.pool, "class-1", &[("Alice", "Robotics")]).await;

        let id = submit(&env, "class-1", "docx").await;
        let status = run_worker_until_terminal(&env, id).await;

        assert_eq!(status, ReportStatus::Failed);
        let request = env.repo.find_by_id(id).await.unwrap();
        assert!(request.error_detail.as_deref().unwrap().contains("docx"));

        // Acked on the first attempt: nothing retried, nothing
        // dead-lettered.
        assert!(env.queue.dead_letters().await.is_empty());
        assert!(env.repo.find_artifact(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rows_gone_by_processing_time_still_completes() {
        let storage = Arc::new(InMemoryBlobStorage::new());
        let env = env_with_storage(storage.clone()).await;
        seed_participation(&env.pool, "class-42", &[("Alice", "Robotics")]).await;

        let id = submit(&env, "class-42", "tabular-pdf").await;

        // The class loses its rows between submission and processing. An
        // empty report is still a completed report.
        sqlx::query("DELETE FROM participation WHERE class_id = ?")
            .bind("class-42")
            .execute(&env.pool)
            .await
            .unwrap();

        let status = run_worker_until_terminal(&env, id).await;
        assert_eq!(status, ReportStatus::Completed);
        let artifact = env.repo.find_artifact(id).await.unwrap().unwrap();
        assert!(storage.object_bytes(&artifact.object_key).await.is_some());
    }

    #[tokio::test]
    async fn test_transient_upload_failures_recover_within_budget() {
        let storage = Arc::new(FlakyBlobStorage::failing(2));
        let env = env_with_storage(storage.clone()).await;
        seed_participation(&env.pool, "class-1", &[("Alice", "Robotics")]).await;

        let id = submit(&env, "class-1", "tabular-pdf").await;
        let status = run_worker_until_terminal(&env, id).await;

        // Third attempt succeeds inside the max-attempts budget.
        assert_eq!(status, ReportStatus::Completed);
        let artifact = env.repo.find_artifact(id).await.unwrap().unwrap();
        assert!(storage.inner.object_bytes(&artifact.object_key).await.is_some());

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM generated_reports WHERE request_id = ?")
                .bind(id.to_string())
                .fetch_one(&env.pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_dead_letter() {
        let storage = Arc::new(FlakyBlobStorage::failing(u32::MAX));
        let env = env_with_storage(storage).await;
        seed_participation(&env.pool, "class-1", &[("Alice", "Robotics")]).await;

        let id = submit(&env, "class-1", "tabular-pdf").await;
        let status = run_worker_until_terminal(&env, id).await;

        assert_eq!(status, ReportStatus::Failed);
        let request = env.repo.find_by_id(id).await.unwrap();
        assert!(request
            .error_detail
            .as_deref()
            .unwrap()
            .contains("simulated upload outage"));

        // The exhausted job is kept for inspection, not discarded.
        let dead = env.queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.request_id, id);
        assert_eq!(dead[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_converges() {
        let storage = Arc::new(InMemoryBlobStorage::new());
        let env = env_with_storage(storage.clone()).await;
        seed_participation(&env.pool, "class-1", &[("Alice", "Robotics")]).await;

        let id = submit(&env, "class-1", "tabular-pdf").await;
        let status = run_worker_until_terminal(&env, id).await;
        assert_eq!(status, ReportStatus::Completed);
        let artifact = env.repo.find_artifact(id).await.unwrap().unwrap();

        // Simulate at-least-once delivery: the same job arrives again.
        env.queue
            .enqueue(&ReportJob {
                request_id: id,
                class_id: "class-1".to_string(),
                report_kind: "tabular-pdf".to_string(),
            })
            .await
            .unwrap();

        let status = run_worker_until_terminal(&env, id).await;
        assert_eq!(status, ReportStatus::Completed);

        // Still exactly one artifact with the same object key.
        let after = env.repo.find_artifact(id).await.unwrap().unwrap();
        assert_eq!(after.object_key, artifact.object_key);
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM generated_reports WHERE request_id = ?")
                .bind(id.to_string())
                .fetch_one(&env.pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }
}
