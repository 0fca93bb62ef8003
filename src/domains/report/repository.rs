use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::{DbError, DomainError, DomainResult};

use super::types::{
    GeneratedReport, NewReportRequest, ReportRequest, ReportRequestSummary, ReportStatus,
};

/// Persistent record of report requests and their lifecycle state.
#[async_trait]
pub trait ReportRequestRepository: Send + Sync {
    /// Insert a new request in `Pending` state.
    async fn create_request(&self, new_request: &NewReportRequest) -> DomainResult<ReportRequest>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ReportRequest>;

    /// Advance the request status. Terminal rows are never modified, which
    /// makes redelivered jobs and late writers harmless.
    async fn update_status(
        &self,
        id: Uuid,
        status: ReportStatus,
        error_detail: Option<String>,
    ) -> DomainResult<()>;

    /// Record the artifact and flip the request to `Completed` in a single
    /// transaction, so a reader observing `Completed` can always find the
    /// artifact row.
    async fn complete_with_artifact(&self, artifact: &GeneratedReport) -> DomainResult<()>;

    async fn find_artifact(&self, request_id: Uuid) -> DomainResult<Option<GeneratedReport>>;

    /// Latest requests first, for dashboards.
    async fn list_recent(&self, limit: i64) -> DomainResult<Vec<ReportRequestSummary>>;
}

pub struct SqliteReportRequestRepository {
    pool: SqlitePool,
}

impl SqliteReportRequestRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn status_to_str(status: &ReportStatus) -> &'static str {
    status.as_str()
}

fn str_to_status(s: &str) -> Option<ReportStatus> {
    match s {
        "pending" => Some(ReportStatus::Pending),
        "processing" => Some(ReportStatus::Processing),
        "completed" => Some(ReportStatus::Completed),
        "failed" => Some(ReportStatus::Failed),
        _ => None,
    }
}

fn parse_timestamp(value: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::Internal(format!("Bad timestamp: {}", e)))
}

fn parse_uuid(value: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| DomainError::InvalidUuid(e.to_string()))
}

fn request_from_row(row: &sqlx::sqlite::SqliteRow) -> DomainResult<ReportRequest> {
    let status_str: String = row.get("status");
    let status = str_to_status(&status_str).ok_or_else(|| {
        DomainError::Internal(format!("Invalid status {} in report_requests", status_str))
    })?;

    let id: String = row.get("id");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(ReportRequest {
        id: parse_uuid(&id)?,
        class_id: row.get("class_id"),
        report_kind: row.get("report_kind"),
        status,
        file_name: row.get("file_name"),
        error_detail: row.get("error_detail"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl ReportRequestRepository for SqliteReportRequestRepository {
    async fn create_request(&self, new_request: &NewReportRequest) -> DomainResult<ReportRequest> {
        let now = Utc::now();
        let request = ReportRequest {
            id: Uuid::new_v4(),
            class_id: new_request.class_id.clone(),
            report_kind: new_request.report_kind.clone(),
            status: ReportStatus::Pending,
            file_name: new_request.file_name.clone(),
            error_detail: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO report_requests (id, class_id, report_kind, status, file_name, \
             error_detail, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id.to_string())
        .bind(&request.class_id)
        .bind(&request.report_kind)
        .bind(status_to_str(&request.status))
        .bind(&request.file_name)
        .bind(&request.error_detail)
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;

        Ok(request)
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ReportRequest> {
        let row = sqlx::query("SELECT * FROM report_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DomainError::Database(DbError::from(e)))?
            .ok_or_else(|| DomainError::EntityNotFound("ReportRequest".to_string(), id))?;

        request_from_row(&row)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ReportStatus,
        error_detail: Option<String>,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE report_requests SET status = ?, error_detail = ?, updated_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(status_to_str(&status))
        .bind(&error_detail)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;

        if result.rows_affected() == 0 {
            log::debug!(
                "Status update to {} skipped for request {} (missing or terminal)",
                status,
                id
            );
        }
        Ok(())
    }

    async fn complete_with_artifact(&self, artifact: &GeneratedReport) -> DomainResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

        // Artifact first, status second. The transaction makes the order
        // matter only for readers of a partially applied state, which
        // cannot occur, and INSERT OR REPLACE keeps redelivery idempotent.
        sqlx::query(
            "INSERT OR REPLACE INTO generated_reports (request_id, class_id, report_kind, \
             file_name, object_key, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(artifact.request_id.to_string())
        .bind(&artifact.class_id)
        .bind(&artifact.report_kind)
        .bind(&artifact.file_name)
        .bind(&artifact.object_key)
        .bind(artifact.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;

        sqlx::query(
            "UPDATE report_requests SET status = 'completed', error_detail = NULL, \
             updated_at = ? WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(artifact.request_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;

        tx.commit()
            .await
            .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;
        Ok(())
    }

    async fn find_artifact(&self, request_id: Uuid) -> DomainResult<Option<GeneratedReport>> {
        let row = sqlx::query("SELECT * FROM generated_reports WHERE request_id = ?")
            .bind(request_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DomainError::Database(DbError::from(e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let request_id_str: String = row.get("request_id");
        let created_at: String = row.get("created_at");
        Ok(Some(GeneratedReport {
            request_id: parse_uuid(&request_id_str)?,
            class_id: row.get("class_id"),
            report_kind: row.get("report_kind"),
            file_name: row.get("file_name"),
            object_key: row.get("object_key"),
            created_at: parse_timestamp(&created_at)?,
        }))
    }

    async fn list_recent(&self, limit: i64) -> DomainResult<Vec<ReportRequestSummary>> {
        let rows = sqlx::query(
            "SELECT id, class_id, report_kind, status, created_at FROM report_requests \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Database(DbError::from(e)))?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let status_str: String = row.get("status");
            let created_at: String = row.get("created_at");
            let status = str_to_status(&status_str).ok_or_else(|| {
                DomainError::Internal(format!("Invalid status {} in report_requests", status_str))
            })?;
            summaries.push(ReportRequestSummary {
                id: parse_uuid(&id)?,
                class_id: row.get("class_id"),
                report_kind: row.get("report_kind"),
                status,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(summaries)
    }
}
