//! Report worker process: consumes generation jobs until interrupted.

use std::sync::Arc;

use class_reports::config::Config;
use class_reports::database;
use class_reports::domains::core::blob_storage_service::S3BlobStorage;
use class_reports::domains::participation::SqliteParticipationRepository;
use class_reports::domains::report::generators::GeneratorRegistry;
use class_reports::domains::report::{ReportWorker, SqliteReportRequestRepository};
use class_reports::queue::{RedisWorkQueue, RetryPolicy};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env()?;

    let pool = database::connect(&config.database).await?;
    database::run_migrations(&pool).await?;

    let queue = Arc::new(RedisWorkQueue::connect(&config.redis, RetryPolicy::default()).await?);
    let storage = Arc::new(S3BlobStorage::new(&config.s3).await);
    let participation = Arc::new(SqliteParticipationRepository::new(pool.clone()));
    let repo = Arc::new(SqliteReportRequestRepository::new(pool));
    let generators = Arc::new(GeneratorRegistry::new(participation, storage));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    ReportWorker::new(queue, repo, generators)
        .with_concurrency(config.worker.concurrency)
        .with_shutdown_signal(shutdown_rx)
        .run()
        .await?;

    Ok(())
}
