pub mod generators;
pub mod repository;
pub mod service;
pub mod types;
pub mod worker;

pub use repository::{ReportRequestRepository, SqliteReportRequestRepository};
pub use service::ReportService;
pub use types::{
    GeneratedReport, NewReportRequest, ReportJob, ReportKind, ReportRequest, ReportStatus,
};
pub use worker::ReportWorker;
