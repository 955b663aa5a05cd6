//! Report and export generation for Spark.
//!
//! Requests are validated into a `JobDefinition`, run through the
//! fetch -> aggregate -> render -> persist pipeline, and delivered by
//! download link, email or storage. Schedules re-run a job template on a
//! recurrence with bounded retries.

pub mod aggregate;
pub mod artifact;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod filter;
pub mod fixtures;
pub mod job;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod request;
pub mod schedule;
pub mod service;
pub mod source;
pub mod store;
pub mod table;

pub use error::{ApiError, ReportError, ReportResult, ValidationErrors};
pub use service::ReportService;
