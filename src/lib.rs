//! Asynchronous class-report generation core.
//!
//! A caller submits a report request for a class and polls for its status;
//! the actual document generation happens off the request path. The pieces:
//!
//! - [`domains::report::ReportService`] validates submissions, persists the
//!   request in `Pending` state and enqueues a job.
//! - [`queue`] is the durable, at-least-once work queue seam
//!   (Redis Streams in production, in-memory for tests and local runs).
//! - [`domains::report::ReportWorker`] consumes jobs with a bounded pool
//!   and drives each request to `Completed` or `Failed`.
//! - [`domains::report::generators`] stream participation rows into a
//!   tabular PDF or spreadsheet, piped into a multipart upload.
//! - [`domains::core::blob_storage_service`] stores artifacts and issues
//!   presigned, time-limited download URLs.
//!
//! There is no global state. Clients are built from [`config::Config`] and
//! injected into the service and worker constructors.

pub mod config;
pub mod database;
pub mod domains;
pub mod errors;
pub mod queue;
