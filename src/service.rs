//! Request-level operations: validate, run, persist and deliver.
//!
//! `ReportService` is what the CLI (or any outer surface) talks to. Job
//! execution itself lives in `JobRunner`, which the schedule manager shares.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::delivery::{DeliveryDispatcher, DownloadHandle};
use crate::error::{ApiError, ErrorKind, ReportError, ReportResult};
use crate::filter::{ReferenceCatalog, ValidationContext};
use crate::job::{JobStatus, JobSummary, ReportJob};
use crate::pipeline::{CancelToken, ReportPipeline};
use crate::request::{parse_export, parse_generate, parse_schedule};
use crate::schedule::{ExecutionOutcome, JobExecutor, RetryPolicy, Schedule, ScheduleManager};
use crate::store::{JobListQuery, JobStore, Page, ScheduleStore};

/// Runs jobs to a terminal state and records them.
pub struct JobRunner {
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<ReportPipeline>,
    dispatcher: Arc<DeliveryDispatcher>,
    in_flight: Mutex<HashMap<Uuid, CancelToken>>,
}

impl JobRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        pipeline: Arc<ReportPipeline>,
        dispatcher: Arc<DeliveryDispatcher>,
    ) -> Self {
        Self {
            jobs,
            pipeline,
            dispatcher,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, CancelToken>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate, persist and deliver a pending job that is already stored.
    pub async fn run(&self, mut job: ReportJob, now: DateTime<Utc>) -> ReportResult<ReportJob> {
        let token = CancelToken::new();
        self.in_flight().insert(job.id, token.clone());
        let produced = self.pipeline.run(&mut job, &token, now).await;
        self.in_flight().remove(&job.id);

        // A pipeline error is already recorded on the job.
        if let Ok(artifact) = produced {
            self.deliver(&mut job, &artifact, now).await?;
        }
        self.jobs.update(&job).await?;
        Ok(job)
    }

    async fn deliver(&self, job: &mut ReportJob, artifact: &Artifact, now: DateTime<Utc>) -> ReportResult<()> {
        match self.dispatcher.deliver(job, artifact, now).await {
            Ok(receipt) => job.delivered(receipt, now),
            Err(err) => {
                // Timeouts while delivering count as delivery failures; the artifact stays.
                let failure = match err {
                    ReportError::DeliveryFailure(_) => err,
                    other => ReportError::DeliveryFailure(other.to_string()),
                };
                warn!(job_id = %job.id, error = %failure, "delivery failed; artifact kept");
                job.fail(&failure, now)
            }
        }
    }

    /// Deliver the stored artifact of a job again, without regenerating it.
    pub async fn redeliver(&self, mut job: ReportJob, now: DateTime<Utc>) -> ReportResult<ReportJob> {
        let path = job
            .file_path
            .clone()
            .ok_or_else(|| ReportError::NotFound(format!("artifact for report job {}", job.id)))?;
        let bytes = self.pipeline.artifacts().get(&path).await?;
        let artifact = Artifact::restore(job.definition.format, bytes, &path);
        self.deliver(&mut job, &artifact, now).await?;
        self.jobs.update(&job).await?;
        Ok(job)
    }

    /// Flag a running job; it stops at the next stage boundary.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.in_flight().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn execute(
        &self,
        schedule: &Schedule,
        retry_of: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> ReportResult<ReportJob> {
        let previous = match retry_of {
            Some(id) => self.jobs.get(id).await?,
            None => None,
        };
        match previous {
            Some(job)
                if job.status == JobStatus::Failed
                    && job.error_kind == Some(ErrorKind::DeliveryFailure)
                    && job.file_path.is_some() =>
            {
                info!(job_id = %job.id, attempt = job.attempts, "retrying delivery from stored artifact");
                self.redeliver(job, now).await
            }
            Some(mut job) if job.status == JobStatus::Failed => {
                job.retry(now)?;
                self.jobs.update(&job).await?;
                info!(job_id = %job.id, attempt = job.attempts, "retrying scheduled job");
                self.run(job, now).await
            }
            _ => {
                let job = ReportJob::new(schedule.template.clone(), Some(schedule.id), now);
                self.jobs.insert(&job).await?;
                self.run(job, now).await
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub timezone: Tz,
    pub retry_policy: RetryPolicy,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            retry_policy: RetryPolicy::default(),
        }
    }
}

pub struct ReportService {
    jobs: Arc<dyn JobStore>,
    catalog: Arc<dyn ReferenceCatalog>,
    runner: Arc<JobRunner>,
    dispatcher: Arc<DeliveryDispatcher>,
    pipeline: Arc<ReportPipeline>,
    scheduler: ScheduleManager,
    timezone: Tz,
}

impl ReportService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        schedules: Arc<dyn ScheduleStore>,
        catalog: Arc<dyn ReferenceCatalog>,
        pipeline: Arc<ReportPipeline>,
        dispatcher: Arc<DeliveryDispatcher>,
        settings: ServiceSettings,
    ) -> Self {
        let runner = Arc::new(JobRunner::new(jobs.clone(), pipeline.clone(), dispatcher.clone()));
        let scheduler = ScheduleManager::new(
            schedules,
            runner.clone(),
            dispatcher.clone(),
            settings.retry_policy,
        );
        Self {
            jobs,
            catalog,
            runner,
            dispatcher,
            pipeline,
            scheduler,
            timezone: settings.timezone,
        }
    }

    pub fn scheduler(&self) -> &ScheduleManager {
        &self.scheduler
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    fn context(&self, now: DateTime<Utc>) -> ValidationContext<'_> {
        ValidationContext::new(now, self.timezone, self.catalog.as_ref())
    }

    /// Validate and run a data export. Replies with the stored file.
    pub async fn submit_export(&self, raw: &Value, now: DateTime<Utc>) -> Result<Value, ApiError> {
        let definition = parse_export(raw, &self.context(now))?;
        let job = ReportJob::new(definition, None, now);
        self.jobs.insert(&job).await?;
        info!(job_id = %job.id, data_type = %job.definition.filter.data_type, "export accepted");

        let job = finished(self.runner.run(job, now).await?)?;
        Ok(json!({
            "file_path": job.file_path,
            "filename": stored_filename(&job),
            "format": job.definition.format,
            "file_size": job.file_size_bytes,
            "delivery": job.delivery,
        }))
    }

    /// Validate and run a canned report, registering its schedule if one was requested.
    pub async fn submit_report(&self, raw: &Value, now: DateTime<Utc>) -> Result<Value, ApiError> {
        let request = parse_generate(raw, &self.context(now))?;
        let template = request.schedule_template();
        let job = ReportJob::new(request.definition, None, now);
        self.jobs.insert(&job).await?;
        info!(job_id = %job.id, report_type = %job.definition.type_label(), "report accepted");

        let job = finished(self.runner.run(job, now).await?)?;
        let schedule_id = match (template, request.schedule) {
            (Some(template), Some(definition)) => {
                let schedule = Schedule::new(template.title.clone(), template, definition, now);
                Some(self.scheduler.register(schedule).await?.id)
            }
            _ => None,
        };

        let mut body = serde_json::to_value(job.summary()).map_err(ReportError::from)?;
        if let Value::Object(map) = &mut body {
            map.insert("file_path".to_string(), json!(job.file_path));
            map.insert("file_size".to_string(), json!(job.file_size_bytes));
            map.insert("schedule_id".to_string(), json!(schedule_id));
        }
        Ok(body)
    }

    /// Validate and register a recurring report.
    pub async fn submit_schedule(&self, raw: &Value, now: DateTime<Utc>) -> Result<Value, ApiError> {
        let template = match raw
            .get("report_template_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id.trim()).ok())
        {
            Some(id) => self.jobs.get(id).await?.map(|job| job.definition),
            None => None,
        };
        let request = parse_schedule(raw, &self.context(now), template.as_ref())?;
        let schedule = Schedule::new(request.title, request.template, request.definition, now);
        let schedule = self.scheduler.register(schedule).await?;
        Ok(serde_json::to_value(&schedule).map_err(ReportError::from)?)
    }

    pub async fn list_reports(&self, query: &JobListQuery) -> Result<Page<JobSummary>, ApiError> {
        Ok(self.jobs.list(query).await?.map(|job| job.summary()))
    }

    pub async fn report(&self, id: Uuid) -> Result<ReportJob, ApiError> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("report {id}")))
    }

    /// Remove a job with its artifact and any download links to it.
    pub async fn delete_report(&self, id: Uuid) -> Result<(), ApiError> {
        let job = self.report(id).await?;
        self.runner.cancel(id);
        if let Some(path) = job.file_path.as_deref() {
            self.pipeline.artifacts().delete(path).await?;
        }
        self.dispatcher.downloads().revoke_job(id);
        self.jobs.delete(id).await?;
        info!(job_id = %id, "report deleted");
        Ok(())
    }

    /// Deliver a stored artifact again to the job's target.
    pub async fn redeliver(&self, id: Uuid, now: DateTime<Utc>) -> Result<ReportJob, ApiError> {
        let job = self.report(id).await?;
        finished(self.runner.redeliver(job, now).await?)
    }

    /// Resolve a download token to the stored bytes.
    pub async fn download(&self, token: &str, now: DateTime<Utc>) -> Result<(DownloadHandle, Vec<u8>), ApiError> {
        let handle = self.dispatcher.downloads().resolve(token, now)?;
        let bytes = self.pipeline.artifacts().get(&handle.file_path).await?;
        Ok((handle, bytes))
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        self.runner.cancel(id)
    }

    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionOutcome>, ApiError> {
        let purged = self.dispatcher.downloads().purge_expired(now);
        if purged > 0 {
            info!(purged, "expired download links removed");
        }
        Ok(self.scheduler.run_due(now).await?)
    }
}

fn finished(job: ReportJob) -> Result<ReportJob, ApiError> {
    if job.status == JobStatus::Completed {
        Ok(job)
    } else {
        Err(ApiError::JobFailed {
            job_id: job.id,
            message: job
                .error_message
                .clone()
                .unwrap_or_else(|| ErrorKind::Internal.to_string()),
        })
    }
}

fn stored_filename(job: &ReportJob) -> Option<String> {
    let path = job.file_path.as_deref()?;
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MemoryMailer;
    use crate::fixtures;
    use crate::pipeline::PipelineSettings;
    use crate::source::{MemoryRepository, SourceRegistry};
    use crate::store::{MemoryArtifactStore, MemoryJobStore, MemoryScheduleStore};
    use chrono::{NaiveDate, TimeZone};
    use std::time::Duration as StdDuration;

    struct Harness {
        service: ReportService,
        repo: Arc<MemoryRepository>,
        jobs: Arc<MemoryJobStore>,
        artifacts: Arc<MemoryArtifactStore>,
        mailer: Arc<MemoryMailer>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let repo = Arc::new(fixtures::demo_repository(
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            60,
        ));
        let jobs = Arc::new(MemoryJobStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let mailer = Arc::new(MemoryMailer::new());
        let pipeline = Arc::new(ReportPipeline::new(
            SourceRegistry::from_repository(repo.clone()),
            artifacts.clone(),
            PipelineSettings::default(),
        ));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            mailer.clone(),
            std::env::temp_dir().join("spark-reports-service-tests"),
            chrono::Duration::hours(24),
            StdDuration::from_secs(5),
        ));
        let service = ReportService::new(
            jobs.clone(),
            Arc::new(MemoryScheduleStore::new()),
            Arc::new(repo.catalog()),
            pipeline,
            dispatcher,
            ServiceSettings::default(),
        );
        Harness {
            service,
            repo,
            jobs,
            artifacts,
            mailer,
        }
    }

    fn export_request() -> Value {
        json!({
            "data_type": "bookings",
            "format": "csv",
            "filename": "march_bookings",
            "filters": {"start_date": "2024-03-01", "end_date": "2024-03-31"}
        })
    }

    #[tokio::test]
    async fn export_replies_with_the_stored_file() {
        let h = harness();
        let body = h.service.submit_export(&export_request(), now()).await.unwrap();
        assert_eq!(body["filename"], "march_bookings.csv");
        assert_eq!(body["format"], "csv");
        assert!(body["file_size"].as_u64().unwrap() > 0);
        assert_eq!(body["delivery"]["method"], "download");
        assert_eq!(h.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn invalid_export_creates_no_job() {
        let h = harness();
        let err = h
            .service
            .submit_export(&json!({"data_type": "bookings", "format": "docx"}), now())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 422);
        assert!(h.jobs.all().is_empty());
    }

    #[tokio::test]
    async fn failed_export_is_recorded_and_reported() {
        let h = harness();
        h.repo.fail_next(1);
        let err = h.service.submit_export(&export_request(), now()).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        let stored = h.jobs.all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, JobStatus::Failed);
        assert_eq!(stored[0].error_kind, Some(ErrorKind::DataUnavailable));
        assert!(h.artifacts.is_empty());
    }

    #[tokio::test]
    async fn report_with_schedule_registers_it() {
        let h = harness();
        let body = h
            .service
            .submit_report(
                &json!({
                    "title": "Monthly Bookings",
                    "report_type": "booking_summary",
                    "filters": {"date_range": "month"},
                    "schedule": {
                        "frequency": "monthly",
                        "day_of_month": 1,
                        "recipients": ["ops@district.org"]
                    }
                }),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(body["status"], "completed");
        assert_eq!(body["type"], "booking_summary");
        assert!(body["schedule_id"].is_string());
    }

    #[tokio::test]
    async fn deleting_a_report_removes_its_artifact_and_links() {
        let h = harness();
        let body = h.service.submit_export(&export_request(), now()).await.unwrap();
        let token = body["delivery"]["token"].as_str().unwrap().to_string();
        let job_id = h.jobs.all()[0].id;

        let (handle, bytes) = h.service.download(&token, now()).await.unwrap();
        assert_eq!(handle.job_id, job_id);
        assert!(!bytes.is_empty());

        h.service.delete_report(job_id).await.unwrap();
        assert!(h.artifacts.is_empty());
        assert!(h.service.download(&token, now()).await.is_err());
        assert_eq!(h.service.report(job_id).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn failed_email_keeps_the_artifact_for_redelivery() {
        let h = harness();
        let mut request = export_request();
        request["delivery_method"] = json!("email");
        request["delivery_email"] = json!("coordinator@district.org");
        h.mailer.fail_next(1);

        let err = h.service.submit_export(&request, now()).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        let failed = h.jobs.all().remove(0);
        assert_eq!(failed.error_kind, Some(ErrorKind::DeliveryFailure));
        assert!(failed.file_path.is_some());

        let redelivered = h.service.redeliver(failed.id, now()).await.unwrap();
        assert_eq!(redelivered.status, JobStatus::Completed);
        assert_eq!(redelivered.checksum, failed.checksum);
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn listing_pages_newest_first() {
        let h = harness();
        for _ in 0..3 {
            h.service.submit_export(&export_request(), now()).await.unwrap();
        }
        let page = h
            .service
            .list_reports(&JobListQuery {
                per_page: 2,
                ..JobListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.last_page, 2);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].report_type, "bookings_export");
    }
}
