use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use spark_reports::delivery::{DeliveryDispatcher, MemoryMailer};
use spark_reports::error::{ApiError, ErrorKind, ReportError, ReportResult};
use spark_reports::fixtures;
use spark_reports::job::JobStatus;
use spark_reports::pipeline::{PipelineSettings, ReportPipeline};
use spark_reports::schedule::{ExecutionOutcome, Schedule};
use spark_reports::service::ServiceSettings;
use spark_reports::source::{MemoryRepository, SourceRegistry};
use spark_reports::store::{
    ArtifactStore, MemoryArtifactStore, MemoryJobStore, MemoryScheduleStore, ScheduleStore,
};
use spark_reports::ReportService;

struct World {
    service: ReportService,
    repo: Arc<MemoryRepository>,
    jobs: Arc<MemoryJobStore>,
    schedules: Arc<dyn ScheduleStore>,
    artifacts: Arc<MemoryArtifactStore>,
    mailer: Arc<MemoryMailer>,
}

fn world(repo: MemoryRepository) -> World {
    world_with_schedules(repo, Arc::new(MemoryScheduleStore::new()))
}

fn world_with_schedules(repo: MemoryRepository, schedules: Arc<dyn ScheduleStore>) -> World {
    let repo = Arc::new(repo);
    let jobs = Arc::new(MemoryJobStore::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let mailer = Arc::new(MemoryMailer::new());
    let pipeline = ReportPipeline::new(
        SourceRegistry::from_repository(repo.clone()),
        artifacts.clone(),
        PipelineSettings::default(),
    );
    let dispatcher = DeliveryDispatcher::new(
        mailer.clone(),
        std::env::temp_dir().join("spark-reports-scenarios"),
        chrono::Duration::hours(24),
        StdDuration::from_secs(5),
    );
    let service = ReportService::new(
        jobs.clone(),
        schedules.clone(),
        Arc::new(repo.catalog()),
        Arc::new(pipeline),
        Arc::new(dispatcher),
        ServiceSettings::default(),
    );
    World {
        service,
        repo,
        jobs,
        schedules,
        artifacts,
        mailer,
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// Reference data plus five January bookings and three from February.
fn january_repository() -> MemoryRepository {
    let repo = fixtures::demo_repository(date(2024, 1, 31), 5);
    for mut booking in fixtures::bookings(date(2024, 2, 20), 3) {
        booking.id += 100;
        booking.booking_reference = format!("BK-{:05}", booking.id);
        repo.insert_booking(booking);
    }
    repo
}

fn validation_fields(err: &ApiError) -> Vec<String> {
    match err {
        ApiError::Validation(errors) => errors.fields().map(str::to_string).collect(),
        other => panic!("expected a validation error, got {other}"),
    }
}

#[tokio::test]
async fn scenario_a_bookings_export_holds_every_matching_row() {
    let w = world(january_repository());
    let body = w
        .service
        .submit_export(
            &json!({
                "data_type": "bookings",
                "format": "csv",
                "filters": {"start_date": "2024-01-01", "end_date": "2024-01-31"}
            }),
            at(2024, 2, 25, 12),
        )
        .await
        .unwrap();

    let path = body["file_path"].as_str().unwrap();
    let bytes = w.artifacts.get(path).await.unwrap();
    let csv = String::from_utf8(bytes).unwrap();
    assert_eq!(csv.lines().count(), 6);
    assert!(csv.starts_with("id,"));
    assert_eq!(body["format"], "csv");
}

#[tokio::test]
async fn scenario_b_monthly_schedule_on_the_31st_is_rejected() {
    let w = world(fixtures::demo_repository(date(2024, 2, 29), 10));
    let err = w
        .service
        .submit_schedule(
            &json!({
                "title": "Month End Bookings",
                "report_type": "booking_summary",
                "frequency": "monthly",
                "day_of_month": 31,
                "time": "09:00",
                "recipients": ["ops@district.org"],
                "filters": {"date_range_type": "relative", "relative_period": "last_month"}
            }),
            at(2024, 3, 1, 8),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert_eq!(validation_fields(&err), ["day_of_month"]);
    assert!(w.schedules.due(at(2030, 1, 1, 0)).await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_c_unknown_columns_are_rejected() {
    let w = world(january_repository());
    let err = w
        .service
        .submit_export(
            &json!({"data_type": "bookings", "columns": ["bogus_column"]}),
            at(2024, 2, 25, 12),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert!(validation_fields(&err).contains(&"columns".to_string()));
    assert!(w.jobs.all().is_empty());
}

#[tokio::test]
async fn scenario_d_pdf_report_limit_is_capped() {
    let w = world(january_repository());
    let err = w
        .service
        .submit_report(
            &json!({
                "report_type": "financial_summary",
                "title": "Annual Revenue",
                "format": "pdf",
                "limit": 20000,
                "filters": {"date_range": "year"}
            }),
            at(2024, 2, 25, 12),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert_eq!(validation_fields(&err), ["limit"]);
    assert!(w.jobs.all().is_empty());
}

#[tokio::test]
async fn scenario_e_retries_twice_then_notifies_once() {
    let w = world(fixtures::demo_repository(date(2024, 2, 29), 30));
    let created = w
        .service
        .submit_schedule(
            &json!({
                "title": "Daily Bookings",
                "report_type": "booking_summary",
                "frequency": "daily",
                "time": "09:00",
                "recipients": ["ops@district.org"],
                "filters": {"date_range_type": "relative", "relative_period": "last_month"},
                "retry_on_failure": true,
                "max_retries": 2,
                "failure_notification_emails": ["oncall@district.org"]
            }),
            at(2024, 3, 1, 8),
        )
        .await
        .unwrap();
    let schedule_id = Uuid::parse_str(created["id"].as_str().unwrap()).unwrap();
    assert_eq!(created["next_run_at"], json!(at(2024, 3, 1, 9)));

    w.repo.fail_next(3);
    let now = at(2024, 3, 1, 9);
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.extend(w.service.run_due(now).await.unwrap());
    }

    assert!(matches!(
        outcomes[0],
        ExecutionOutcome::RetryScheduled { attempt: 1, .. }
    ));
    assert!(matches!(
        outcomes[1],
        ExecutionOutcome::RetryScheduled { attempt: 2, .. }
    ));
    match &outcomes[2] {
        ExecutionOutcome::Failed {
            notified,
            next_run_at,
            ..
        } => {
            assert!(*notified);
            assert_eq!(*next_run_at, Some(at(2024, 3, 2, 9)));
        }
        other => panic!("expected a final failure, got {other:?}"),
    }
    assert!(w.service.run_due(now).await.unwrap().is_empty());

    let sent = w.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, ["oncall@district.org"]);
    assert_eq!(sent[0].subject, "Scheduled Report Failed: Daily Bookings");

    let jobs = w.jobs.all();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].attempts, 3);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].error_kind, Some(ErrorKind::DataUnavailable));

    let schedule = w.schedules.get(schedule_id).await.unwrap().unwrap();
    assert_eq!(schedule.next_run_at, Some(at(2024, 3, 2, 9)));
    assert_eq!(schedule.retry, None);
    assert_eq!(schedule.execution_count, 1);
}

#[tokio::test]
async fn identical_exports_have_identical_bytes() {
    let w = world(january_repository());
    let request = json!({
        "data_type": "bookings",
        "format": "json",
        "filters": {"start_date": "2024-01-01", "end_date": "2024-01-31"}
    });
    let mut bodies = Vec::new();
    for hour in [12, 13] {
        let body = w
            .service
            .submit_export(&request, at(2024, 2, 25, hour))
            .await
            .unwrap();
        bodies.push(body);
    }
    let first = w.artifacts.get(bodies[0]["file_path"].as_str().unwrap()).await.unwrap();
    let second = w.artifacts.get(bodies[1]["file_path"].as_str().unwrap()).await.unwrap();
    assert_eq!(first, second);
    assert!(String::from_utf8(first).unwrap().contains("\"as_of\": \"2024-01-31\""));

    let checksums: Vec<String> = w.jobs.all().into_iter().filter_map(|job| job.checksum).collect();
    assert_eq!(checksums.len(), 2);
    assert_eq!(checksums[0], checksums[1]);
}

#[tokio::test]
async fn regenerated_reports_match_across_runs() {
    let w = world(january_repository());
    let request = json!({
        "report_type": "booking_summary",
        "title": "January Bookings",
        "format": "csv",
        "filters": {"date_range": "custom", "start_date": "2024-01-01", "end_date": "2024-01-31"}
    });
    let mut artifacts = Vec::new();
    for day in [25, 26] {
        let body = w.service.submit_report(&request, at(2024, 2, day, 9)).await.unwrap();
        let bytes = w.artifacts.get(body["file_path"].as_str().unwrap()).await.unwrap();
        artifacts.push(bytes);
    }
    assert_eq!(artifacts[0], artifacts[1]);
}

#[tokio::test]
async fn duplicate_recipients_are_rejected() {
    let w = world(fixtures::demo_repository(date(2024, 2, 29), 10));
    let err = w
        .service
        .submit_schedule(
            &json!({
                "title": "Weekly Bookings",
                "report_type": "booking_summary",
                "frequency": "weekly",
                "day_of_week": 1,
                "time": "09:00",
                "recipients": ["ops@district.org", "ops@district.org"],
                "filters": {"date_range_type": "relative", "relative_period": "last_week"}
            }),
            at(2024, 3, 1, 8),
        )
        .await
        .unwrap_err();
    assert_eq!(validation_fields(&err), ["recipients"]);
}

#[tokio::test]
async fn aged_export_ranges_fail_validation_without_a_job() {
    let w = world(january_repository());
    let err = w
        .service
        .submit_export(
            &json!({
                "data_type": "bookings",
                "format": "csv",
                "filters": {"start_date": "2020-01-01", "end_date": "2020-06-30"}
            }),
            at(2024, 2, 1, 12),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert_eq!(validation_fields(&err), ["filters.start_date"]);
    assert!(w.jobs.all().is_empty());
}

#[tokio::test]
async fn nested_report_schedules_email_their_recipients() {
    let w = world(january_repository());
    let mut request = json!({
        "report_type": "booking_summary",
        "title": "Daily Bookings",
        "format": "csv",
        "filters": {"date_range": "month"},
        "schedule": {"frequency": "daily", "recipients": ["ops@district.org", "ops@district.org"]}
    });
    let err = w
        .service
        .submit_report(&request, at(2024, 2, 25, 12))
        .await
        .unwrap_err();
    assert_eq!(validation_fields(&err), ["schedule.recipients"]);

    request["schedule"]["recipients"] = json!(["ops@district.org"]);
    let body = w.service.submit_report(&request, at(2024, 2, 25, 12)).await.unwrap();
    assert!(body["schedule_id"].is_string());
    assert!(w.mailer.sent().is_empty());

    let outcomes = w.service.run_due(at(2024, 2, 26, 9)).await.unwrap();
    assert!(matches!(outcomes[..], [ExecutionOutcome::Completed { .. }]));
    let sent = w.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, ["ops@district.org"]);
    assert_eq!(sent[0].subject, "Scheduled Report: Daily Bookings");
}

#[tokio::test]
async fn undelivered_failure_notices_are_not_reported_as_sent() {
    let w = world(fixtures::demo_repository(date(2024, 2, 29), 10));
    w.service
        .submit_schedule(
            &json!({
                "title": "Daily Bookings",
                "report_type": "booking_summary",
                "frequency": "daily",
                "time": "09:00",
                "recipients": ["ops@district.org"],
                "filters": {"date_range_type": "relative", "relative_period": "last_month"},
                "retry_on_failure": false,
                "failure_notification_emails": ["oncall@district.org"]
            }),
            at(2024, 3, 1, 8),
        )
        .await
        .unwrap();

    w.repo.fail_next(1);
    w.mailer.fail_next(1);
    let outcomes = w.service.run_due(at(2024, 3, 1, 9)).await.unwrap();
    match &outcomes[..] {
        [ExecutionOutcome::Failed { notified, .. }] => assert!(!*notified),
        other => panic!("expected one failed execution, got {other:?}"),
    }
    assert!(w.mailer.sent().is_empty());
}

/// Schedule store whose writes fail for one schedule.
struct BrokenWrites {
    inner: MemoryScheduleStore,
    broken: std::sync::Mutex<Option<Uuid>>,
}

#[async_trait]
impl ScheduleStore for BrokenWrites {
    async fn insert(&self, schedule: &Schedule) -> ReportResult<()> {
        self.inner.insert(schedule).await
    }

    async fn update(&self, schedule: &Schedule) -> ReportResult<()> {
        if *self.broken.lock().unwrap() == Some(schedule.id) {
            return Err(ReportError::Storage("disk full".to_string()));
        }
        self.inner.update(schedule).await
    }

    async fn get(&self, id: Uuid) -> ReportResult<Option<Schedule>> {
        self.inner.get(id).await
    }

    async fn due(&self, now: DateTime<Utc>) -> ReportResult<Vec<Schedule>> {
        self.inner.due(now).await
    }
}

#[tokio::test]
async fn one_failing_schedule_does_not_block_the_others() {
    let store = Arc::new(BrokenWrites {
        inner: MemoryScheduleStore::new(),
        broken: std::sync::Mutex::new(None),
    });
    let w = world_with_schedules(fixtures::demo_repository(date(2024, 2, 29), 10), store.clone());
    let mut ids = Vec::new();
    for title in ["Daily Bookings", "Daily Bookings Copy"] {
        let created = w
            .service
            .submit_schedule(
                &json!({
                    "title": title,
                    "report_type": "booking_summary",
                    "frequency": "daily",
                    "time": "09:00",
                    "recipients": ["ops@district.org"],
                    "filters": {"date_range_type": "relative", "relative_period": "last_month"}
                }),
                at(2024, 3, 1, 8),
            )
            .await
            .unwrap();
        ids.push(Uuid::parse_str(created["id"].as_str().unwrap()).unwrap());
    }
    *store.broken.lock().unwrap() = Some(ids[0]);

    let outcomes = w.service.run_due(at(2024, 3, 1, 9)).await.unwrap();
    match &outcomes[..] {
        [ExecutionOutcome::Completed { schedule_id, .. }] => assert_eq!(*schedule_id, ids[1]),
        other => panic!("expected only the healthy schedule to finish, got {other:?}"),
    }
    let healthy = w.schedules.get(ids[1]).await.unwrap().unwrap();
    assert_eq!(healthy.execution_count, 1);
    assert_eq!(healthy.next_run_at, Some(at(2024, 3, 2, 9)));
}
