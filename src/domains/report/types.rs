use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ValidationError;

/// Report output formats supported by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    TabularPdf,
    TabularXlsx,
}

impl ReportKind {
    /// Canonical wire name, used in requests, job payloads and storage rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::TabularPdf => "tabular-pdf",
            ReportKind::TabularXlsx => "tabular-spreadsheet",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            ReportKind::TabularPdf => "pdf",
            ReportKind::TabularXlsx => "xlsx",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ReportKind::TabularPdf => "application/pdf",
            ReportKind::TabularXlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tabular-pdf" => Ok(ReportKind::TabularPdf),
            "tabular-spreadsheet" => Ok(ReportKind::TabularXlsx),
            other => Err(ValidationError::invalid_value(
                "report_kind",
                &format!("unsupported report kind '{}'", other),
            )),
        }
    }
}

/// Report request lifecycle states.
///
/// This is the single canonical status type. Producers and consumers convert
/// to and from text only at the repository boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Processing => "processing",
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
        }
    }

    /// Completed and Failed are terminal. No transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Completed | ReportStatus::Failed)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row mapped to the `report_requests` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub id: Uuid,
    pub class_id: String,
    /// The kind exactly as requested. Parsed into [`ReportKind`] by the
    /// worker, so that an unsupported kind fails the job rather than the
    /// submission.
    pub report_kind: String,
    pub status: ReportStatus,
    pub file_name: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a report request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReportRequest {
    pub class_id: String,
    pub report_kind: String,
    pub file_name: Option<String>,
}

/// Artifact metadata for a completed request, one-to-one with the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedReport {
    pub request_id: Uuid,
    pub class_id: String,
    pub report_kind: String,
    pub file_name: String,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
}

/// Queue message instructing a worker to generate one report.
///
/// Carries everything needed to process without reading the status store
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportJob {
    pub request_id: Uuid,
    pub class_id: String,
    pub report_kind: String,
}

/// Compact listing row for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRequestSummary {
    pub id: Uuid,
    pub class_id: String,
    pub report_kind: String,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
}

/// Status view returned to polling callers.
#[derive(Debug, Clone, Serialize)]
pub struct ReportStatusView {
    pub status: ReportStatus,
    pub error_detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [ReportKind::TabularPdf, ReportKind::TabularXlsx] {
            assert_eq!(kind.as_str().parse::<ReportKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = "docx".parse::<ReportKind>().unwrap_err();
        assert!(err.to_string().contains("docx"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ReportStatus::Pending.is_terminal());
        assert!(!ReportStatus::Processing.is_terminal());
        assert!(ReportStatus::Completed.is_terminal());
        assert!(ReportStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_payload_round_trip() {
        let job = ReportJob {
            request_id: Uuid::new_v4(),
            class_id: "class-42".to_string(),
            report_kind: "tabular-pdf".to_string(),
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: ReportJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
