//! Report job records and their state machine.
//!
//! `pending -> running -> completed | failed`. A failed job only moves again
//! through `retry`, which bumps the attempt counter on the same record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregation;
use crate::artifact::ArtifactOptions;
use crate::delivery::{DeliveryReceipt, DeliveryTarget};
use crate::error::{ErrorKind, ReportError, ReportResult};
use crate::filter::FilterSpecification;
use crate::models::{ExportFormat, ReportType};
use crate::render::RenderOptions;
use crate::table::SortDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to (re)run a job. Fixed once the job is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// `None` for plain data exports.
    pub report_type: Option<ReportType>,
    pub title: String,
    pub description: Option<String>,
    pub format: ExportFormat,
    pub filter: FilterSpecification,
    pub aggregation: Option<Aggregation>,
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_direction: SortDirection,
    pub limit: Option<usize>,
    pub render: RenderOptions,
    #[serde(default)]
    pub artifact: ArtifactOptions,
    pub delivery: DeliveryTarget,
    /// Base file name without extension.
    pub filename: String,
    #[serde(default)]
    pub include_charts: bool,
    #[serde(default)]
    pub include_raw_data: bool,
}

impl JobDefinition {
    /// Listing label: the report type, or `<data_type>_export`.
    pub fn type_label(&self) -> String {
        match self.report_type {
            Some(report_type) => report_type.as_str().to_string(),
            None => format!("{}_export", self.filter.data_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJob {
    pub id: Uuid,
    pub definition: JobDefinition,
    pub schedule_id: Option<Uuid>,
    pub status: JobStatus,
    /// Incremented by every `retry`.
    pub attempts: u32,
    pub file_path: Option<String>,
    pub file_size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub delivery: Option<DeliveryReceipt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReportJob {
    pub fn new(definition: JobDefinition, schedule_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition,
            schedule_id,
            status: JobStatus::Pending,
            attempts: 1,
            file_path: None,
            file_size_bytes: None,
            checksum: None,
            generated_at: None,
            error_kind: None,
            error_message: None,
            delivery: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> ReportResult<()> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Failed)
        );
        if !allowed {
            return Err(ReportError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> ReportResult<()> {
        self.transition(JobStatus::Running, now)
    }

    pub fn complete(
        &mut self,
        file_path: String,
        file_size_bytes: u64,
        checksum: String,
        now: DateTime<Utc>,
    ) -> ReportResult<()> {
        self.transition(JobStatus::Completed, now)?;
        self.file_path = Some(file_path);
        self.file_size_bytes = Some(file_size_bytes);
        self.checksum = Some(checksum);
        self.generated_at = Some(now);
        Ok(())
    }

    /// Record `error`. A job with a persisted artifact keeps it; delivery can be retried.
    pub fn fail(&mut self, error: &ReportError, now: DateTime<Utc>) -> ReportResult<()> {
        if self.status == JobStatus::Completed && error.kind() == ErrorKind::DeliveryFailure {
            self.status = JobStatus::Failed;
            self.updated_at = now;
        } else {
            self.transition(JobStatus::Failed, now)?;
            self.file_path = None;
            self.file_size_bytes = None;
            self.checksum = None;
        }
        self.error_kind = Some(error.kind());
        self.error_message = Some(error.job_message());
        Ok(())
    }

    /// Put a failed job back in the queue as a new attempt.
    pub fn retry(&mut self, now: DateTime<Utc>) -> ReportResult<()> {
        if self.status != JobStatus::Failed {
            return Err(ReportError::InvalidTransition {
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.status = JobStatus::Pending;
        self.attempts += 1;
        self.file_path = None;
        self.file_size_bytes = None;
        self.checksum = None;
        self.error_kind = None;
        self.error_message = None;
        self.delivery = None;
        self.updated_at = now;
        Ok(())
    }

    /// A failed delivery succeeded on a later attempt from the stored artifact.
    pub fn delivered(&mut self, receipt: DeliveryReceipt, now: DateTime<Utc>) -> ReportResult<()> {
        match self.status {
            JobStatus::Completed => {}
            JobStatus::Failed
                if self.error_kind == Some(ErrorKind::DeliveryFailure)
                    && self.file_path.is_some() =>
            {
                self.status = JobStatus::Completed;
                self.error_kind = None;
                self.error_message = None;
            }
            from => {
                return Err(ReportError::InvalidTransition {
                    from,
                    to: JobStatus::Completed,
                })
            }
        }
        self.delivery = Some(receipt);
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            title: self.definition.title.clone(),
            report_type: self.definition.type_label(),
            format: self.definition.format,
            status: self.status,
            generated_at: self.generated_at,
        }
    }
}

/// Row of the job listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub title: String,
    #[serde(rename = "type")]
    pub report_type: String,
    pub format: ExportFormat,
    pub status: JobStatus,
    pub generated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{DateRange, EXPORT_MAX_SPAN_DAYS};
    use crate::models::DataType;
    use chrono::TimeZone;

    fn definition() -> JobDefinition {
        JobDefinition {
            report_type: None,
            title: "Bookings Export".to_string(),
            description: None,
            format: ExportFormat::Csv,
            filter: FilterSpecification::new(DataType::Bookings, DateRange::All, EXPORT_MAX_SPAN_DAYS),
            aggregation: None,
            sort_by: None,
            sort_direction: SortDirection::Desc,
            limit: None,
            render: RenderOptions::default(),
            artifact: ArtifactOptions::default(),
            delivery: DeliveryTarget::Download,
            filename: "bookings_export".to_string(),
            include_charts: false,
            include_raw_data: false,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn happy_path_sets_artifact_fields() {
        let mut job = ReportJob::new(definition(), None, now());
        job.start(now()).unwrap();
        job.complete("exports/a.csv".to_string(), 42, "abc".to_string(), now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.file_path.as_deref(), Some("exports/a.csv"));
        assert_eq!(job.generated_at, Some(now()));
        assert_eq!(job.summary().report_type, "bookings_export");
    }

    #[test]
    fn transitions_are_forward_only() {
        let mut job = ReportJob::new(definition(), None, now());
        assert!(job
            .complete("x".to_string(), 1, "c".to_string(), now())
            .is_err());
        job.start(now()).unwrap();
        assert!(job.start(now()).is_err());
        job.fail(&ReportError::DataUnavailable("down".to_string()), now())
            .unwrap();
        assert!(job.start(now()).is_err());
        assert!(job.fail(&ReportError::Encryption, now()).is_err());
    }

    #[test]
    fn failure_records_kind_prefixed_message() {
        let mut job = ReportJob::new(definition(), None, now());
        job.start(now()).unwrap();
        job.fail(&ReportError::DataUnavailable("booking store unreachable".to_string()), now())
            .unwrap();
        assert_eq!(job.error_kind, Some(ErrorKind::DataUnavailable));
        assert_eq!(
            job.error_message.as_deref(),
            Some("DataUnavailable: data source unavailable: booking store unreachable")
        );
        assert!(job.file_path.is_none());
    }

    #[test]
    fn retry_reuses_the_record_with_a_new_attempt() {
        let mut job = ReportJob::new(definition(), None, now());
        let id = job.id;
        job.start(now()).unwrap();
        job.fail(&ReportError::Timeout { stage: crate::error::Stage::Fetch, secs: 5 }, now())
            .unwrap();
        job.retry(now()).unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn delivery_failure_keeps_the_artifact_for_redelivery() {
        let mut job = ReportJob::new(definition(), None, now());
        job.start(now()).unwrap();
        job.complete("exports/a.csv".to_string(), 42, "abc".to_string(), now())
            .unwrap();
        job.fail(&ReportError::DeliveryFailure("smtp down".to_string()), now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.file_path.as_deref(), Some("exports/a.csv"));

        job.delivered(
            DeliveryReceipt::Storage {
                path: "archive/a.csv".to_string(),
            },
            now(),
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error_message.is_none());
    }
}
