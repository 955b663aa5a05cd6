//! Error types for report generation.
//!
//! `ValidationErrors` is returned at the request boundary and never reaches a job.
//! Everything that can go wrong once a job is running is a `ReportError`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;
use crate::models::ExportFormat;

/// Result type for pipeline operations.
pub type ReportResult<T> = Result<T, ReportError>;

/// Pipeline stage names used in timeout and cancellation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Fetch,
    Aggregate,
    Render,
    Persist,
    Deliver,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Fetch => "fetch",
            Stage::Aggregate => "aggregate",
            Stage::Render => "render",
            Stage::Persist => "persist",
            Stage::Deliver => "deliver",
        };
        f.write_str(name)
    }
}

/// Errors raised while a report job executes.
#[derive(Error, Debug)]
pub enum ReportError {
    /// An upstream store could not be reached.
    #[error("data source unavailable: {0}")]
    DataUnavailable(String),

    /// Row count exceeded the ceiling for the output format.
    #[error("{rows} rows exceed the {max} row limit for {format} output")]
    RenderLimitExceeded {
        format: ExportFormat,
        rows: usize,
        max: usize,
    },

    /// A stage ran past its time bound.
    #[error("{stage} stage timed out after {secs} seconds")]
    Timeout { stage: Stage, secs: u64 },

    /// Email or storage write failed.
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    /// The job was cancelled between stages.
    #[error("job cancelled before {stage} stage")]
    Cancelled { stage: Stage },

    /// Persisted filters no longer pass validation.
    #[error("filters are no longer valid: {0}")]
    StaleFilter(ValidationErrors),

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encryption failed")]
    Encryption,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

/// Coarse classification of a `ReportError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DataUnavailable,
    RenderLimitExceeded,
    Timeout,
    DeliveryFailure,
    Cancelled,
    StaleFilter,
    Internal,
}

impl ErrorKind {
    /// Whether a schedule may retry an execution that failed this way.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::DataUnavailable | ErrorKind::Timeout | ErrorKind::DeliveryFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DataUnavailable => "DataUnavailable",
            ErrorKind::RenderLimitExceeded => "RenderLimitExceeded",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::DeliveryFailure => "DeliveryFailure",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::StaleFilter => "StaleFilter",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReportError::DataUnavailable(_) => ErrorKind::DataUnavailable,
            ReportError::RenderLimitExceeded { .. } => ErrorKind::RenderLimitExceeded,
            ReportError::Timeout { .. } => ErrorKind::Timeout,
            ReportError::DeliveryFailure(_) => ErrorKind::DeliveryFailure,
            ReportError::Cancelled { .. } => ErrorKind::Cancelled,
            ReportError::StaleFilter(_) => ErrorKind::StaleFilter,
            ReportError::Aggregation(_)
            | ReportError::Render(_)
            | ReportError::Storage(_)
            | ReportError::Encryption
            | ReportError::NotFound(_)
            | ReportError::InvalidTransition { .. } => ErrorKind::Internal,
        }
    }

    /// Message stored on a failed job: `"<kind>: <message>"`.
    pub fn job_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<sqlx::Error> for ReportError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ReportError::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => ReportError::DataUnavailable(err.to_string()),
            other => ReportError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ReportError {
    fn from(err: serde_json::Error) -> Self {
        ReportError::Storage(format!("serialization failed: {err}"))
    }
}

/// Field-indexed validation failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    errors: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.errors.contains_key(field)
    }

    /// True when any error is recorded for `field` or one of its children.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.errors
            .keys()
            .any(|key| key == prefix || key.starts_with(&format!("{prefix}.")))
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.errors.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.errors.keys().map(String::as_str)
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, messages) in other.errors {
            self.errors.entry(field).or_default().extend(messages);
        }
    }

    /// Re-key every field under `prefix`, e.g. `frequency` -> `schedule.frequency`.
    pub fn nested(self, prefix: &str) -> ValidationErrors {
        let errors = self
            .errors
            .into_iter()
            .map(|(field, messages)| (format!("{prefix}.{field}"), messages))
            .collect();
        ValidationErrors { errors }
    }

    pub fn into_result<T>(self, value: T) -> Result<T, ValidationErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "message": "The given data was invalid.",
            "errors": self.errors,
        })
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.errors {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Errors surfaced to callers of the service layer.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("not found: {0}")]
    NotFound(String),

    /// The job ran and ended `failed`; `message` is the stored job message.
    #[error("report job {job_id} failed: {message}")]
    JobFailed { job_id: Uuid, message: String },

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 422,
            ApiError::NotFound(_) => 404,
            ApiError::Report(ReportError::NotFound(_)) => 404,
            ApiError::JobFailed { .. } | ApiError::Report(_) => 500,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ApiError::Validation(errors) => errors.to_json(),
            other => serde_json::json!({ "message": other.to_string() }),
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        ApiError::Validation(errors)
    }
}
