//! Fetch, aggregate, render and persist for one report job.
//!
//! Stages run strictly in sequence. Cancellation is observed between stages,
//! and a failed or cancelled run leaves nothing behind in the artifact store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::artifact::Artifact;
use crate::error::{ReportError, ReportResult, Stage};
use crate::job::{JobDefinition, ReportJob};
use crate::render::{self, RenderOptions};
use crate::report::{self, ReportDocument};
use crate::source::{FetchRequest, SourceRegistry};
use crate::store::ArtifactStore;
use crate::table::Table;

/// Shared flag an outside caller sets to stop a job at the next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, stage: Stage) -> ReportResult<()> {
        if self.is_cancelled() {
            Err(ReportError::Cancelled { stage })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fetch_timeout: Duration,
    pub render_timeout: Duration,
    /// Calendar used for "today" and report timestamps.
    pub timezone: Tz,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(120),
            render_timeout: Duration::from_secs(60),
            timezone: Tz::UTC,
        }
    }
}

pub struct ReportPipeline {
    sources: SourceRegistry,
    artifacts: Arc<dyn ArtifactStore>,
    settings: PipelineSettings,
}

impl ReportPipeline {
    pub fn new(
        sources: SourceRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            sources,
            artifacts,
            settings,
        }
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Drive a pending `job` to `completed` or `failed`.
    ///
    /// Every run is a fresh fetch; nothing from an earlier attempt is reused.
    pub async fn run(
        &self,
        job: &mut ReportJob,
        cancel: &CancelToken,
        now: DateTime<Utc>,
    ) -> ReportResult<Artifact> {
        job.start(now)?;
        info!(
            job_id = %job.id,
            data_type = %job.definition.filter.data_type,
            format = %job.definition.format,
            attempt = job.attempts,
            "report job running"
        );

        match self.produce(job, cancel, now).await {
            Ok((artifact, path)) => {
                job.complete(path, artifact.size_bytes, artifact.checksum.clone(), now)?;
                info!(
                    job_id = %job.id,
                    bytes = artifact.size_bytes,
                    "report job completed"
                );
                Ok(artifact)
            }
            Err(err) => {
                warn!(job_id = %job.id, kind = %err.kind(), error = %err, "report job failed");
                job.fail(&err, now)?;
                Err(err)
            }
        }
    }

    async fn produce(
        &self,
        job: &ReportJob,
        cancel: &CancelToken,
        now: DateTime<Utc>,
    ) -> ReportResult<(Artifact, String)> {
        let definition = &job.definition;
        let local_now = now.with_timezone(&self.settings.timezone);
        let today = local_now.date_naive();

        cancel.check(Stage::Validate)?;
        definition
            .filter
            .revalidate(today)
            .map_err(ReportError::StaleFilter)?;

        cancel.check(Stage::Fetch)?;
        let fetched = self.fetch(definition, today).await?;
        debug!(job_id = %job.id, rows = fetched.len(), "rows fetched");

        cancel.check(Stage::Aggregate)?;
        let document = build_document(definition, fetched, today)?;

        cancel.check(Stage::Render)?;
        let artifact = self
            .render(document, definition)
            .await?
            .post_process(&definition.artifact)?;

        cancel.check(Stage::Persist)?;
        let folder = if definition.report_type.is_some() {
            "reports"
        } else {
            "exports"
        };
        let key = format!(
            "{folder}/{}/{}.{}",
            job.id,
            definition.filename,
            artifact.extension()
        );
        let path = self.artifacts.put(&key, &artifact.bytes).await?;
        Ok((artifact, path))
    }

    async fn fetch(&self, definition: &JobDefinition, today: chrono::NaiveDate) -> ReportResult<Table> {
        let source = self.sources.get(definition.filter.data_type)?;
        let ceiling = definition.format.max_rows() + 1;
        // Summaries, grouping and sorting need the whole filtered set.
        let limit = if definition.report_type.is_some()
            || definition.aggregation.is_some()
            || definition.sort_by.is_some()
        {
            None
        } else {
            Some(definition.limit.map_or(ceiling, |limit| limit.min(ceiling)))
        };
        let request = FetchRequest {
            query: definition.filter.query(today),
            today,
            limit,
        };
        let secs = self.settings.fetch_timeout.as_secs();
        tokio::time::timeout(self.settings.fetch_timeout, source.fetch(&request))
            .await
            .map_err(|_| ReportError::Timeout {
                stage: Stage::Fetch,
                secs,
            })?
    }

    async fn render(&self, document: ReportDocument, definition: &JobDefinition) -> ReportResult<Artifact> {
        let format = definition.format;
        let options: RenderOptions = definition.render.clone();
        let secs = self.settings.render_timeout.as_secs();
        let handle =
            tokio::task::spawn_blocking(move || render::render(&document, format, &options));
        match tokio::time::timeout(self.settings.render_timeout, handle).await {
            Err(_) => Err(ReportError::Timeout {
                stage: Stage::Render,
                secs,
            }),
            Ok(Err(join_error)) => Err(ReportError::Render(join_error.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

/// Sort, limit, project and group the fetched rows into a renderable document.
pub fn build_document(
    definition: &JobDefinition,
    mut table: Table,
    today: chrono::NaiveDate,
) -> ReportResult<ReportDocument> {
    let filter = &definition.filter;
    let as_of = filter.date_range.resolve(today).end.unwrap_or(today);
    let summary = definition
        .report_type
        .map(|report_type| report::summarize(report_type, &table))
        .unwrap_or_default();

    if let Some(sort_by) = &definition.sort_by {
        table.sort_by_column(sort_by, definition.sort_direction);
    }
    if let Some(limit) = definition.limit {
        table.truncate(limit);
    }

    let mut columns = filter.output_columns();
    if let Some(aggregation) = &definition.aggregation {
        if let Some(source) = aggregation.group_by.source_column(filter.data_type) {
            if !columns.iter().any(|column| column == source) {
                columns.insert(0, source.to_string());
            }
        }
    }
    let table = table.project(&columns);
    let table = aggregate::apply(table, filter.data_type, definition.aggregation.as_ref())?;

    // Generated reports list rows only when asked to, or when grouped.
    let table = if definition.report_type.is_some()
        && !definition.include_raw_data
        && definition.aggregation.is_none()
    {
        Table::default()
    } else {
        table
    };

    Ok(ReportDocument {
        title: definition.title.clone(),
        description: definition.description.clone(),
        as_of,
        period: filter.date_range.label(),
        summary,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateFn, Aggregation, GroupBy};
    use crate::artifact::ArtifactOptions;
    use crate::delivery::DeliveryTarget;
    use crate::filter::{DateRange, FilterSpecification, EXPORT_MAX_SPAN_DAYS};
    use crate::job::JobStatus;
    use crate::models::{BookingRecord, DataType, ExportFormat};
    use crate::source::MemoryRepository;
    use crate::store::MemoryArtifactStore;
    use crate::table::{SortDirection, Value};
    use chrono::{NaiveDate, TimeZone};

    fn booking(id: i64, school: &str, students: i32, day: u32) -> BookingRecord {
        BookingRecord {
            id,
            booking_reference: format!("BK-{id:04}"),
            school_id: 1,
            school_name: school.to_string(),
            district_id: Some(1),
            program_id: 1,
            program_title: "Robotics Lab".to_string(),
            teacher_id: Some(9),
            teacher_name: "Avery Park".to_string(),
            status: "confirmed".to_string(),
            payment_status: "paid".to_string(),
            student_count: students,
            total_cost: students as f64 * 12.5,
            grade_levels: vec!["5".to_string()],
            confirmed_date: NaiveDate::from_ymd_opt(2024, 1, day),
            payment_due_date: None,
            created_at: NaiveDate::from_ymd_opt(2024, 1, day)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            deleted: false,
        }
    }

    fn definition(format: ExportFormat) -> JobDefinition {
        JobDefinition {
            report_type: None,
            title: "Bookings Export".to_string(),
            description: None,
            format,
            filter: FilterSpecification::new(
                DataType::Bookings,
                DateRange::Fixed {
                    start: NaiveDate::from_ymd_opt(2024, 1, 1),
                    end: NaiveDate::from_ymd_opt(2024, 1, 31),
                },
                EXPORT_MAX_SPAN_DAYS,
            ),
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
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn pipeline(repo: Arc<MemoryRepository>) -> (ReportPipeline, Arc<MemoryArtifactStore>) {
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = ReportPipeline::new(
            SourceRegistry::from_repository(repo),
            store.clone(),
            PipelineSettings::default(),
        );
        (pipeline, store)
    }

    fn seeded() -> Arc<MemoryRepository> {
        let repo = MemoryRepository::new();
        repo.insert_booking(booking(1, "Oak Elementary", 20, 3));
        repo.insert_booking(booking(2, "Elm Middle", 35, 9));
        repo.insert_booking(booking(3, "Oak Elementary", 10, 17));
        repo.insert_booking(booking(4, "Pine High", 50, 20));
        Arc::new(repo)
    }

    #[tokio::test]
    async fn completed_job_points_at_a_stored_artifact() {
        let (pipeline, store) = pipeline(seeded());
        let mut job = ReportJob::new(definition(ExportFormat::Csv), None, now());
        let artifact = pipeline.run(&mut job, &CancelToken::new(), now()).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        let path = job.file_path.clone().unwrap();
        assert!(path.ends_with("/bookings_export.csv"));
        assert_eq!(store.get(&path).await.unwrap(), artifact.bytes);
        assert_eq!(job.file_size_bytes, Some(artifact.size_bytes));
        let text = String::from_utf8(artifact.bytes).unwrap();
        assert_eq!(text.lines().count(), 5);
    }

    #[tokio::test]
    async fn identical_runs_produce_identical_bytes() {
        let (pipeline, _) = pipeline(seeded());
        let mut first = ReportJob::new(definition(ExportFormat::Json), None, now());
        let mut second = ReportJob::new(definition(ExportFormat::Json), None, now());
        let a = pipeline.run(&mut first, &CancelToken::new(), now()).await.unwrap();
        let b = pipeline.run(&mut second, &CancelToken::new(), now()).await.unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.checksum, b.checksum);
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_job_without_an_artifact() {
        let repo = seeded();
        repo.fail_next(1);
        let (pipeline, store) = pipeline(repo);
        let mut job = ReportJob::new(definition(ExportFormat::Csv), None, now());
        let err = pipeline.run(&mut job, &CancelToken::new(), now()).await.unwrap_err();

        assert!(matches!(err, ReportError::DataUnavailable(_)));
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("DataUnavailable: "));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let repo = MemoryRepository::new().with_latency(Duration::from_millis(200));
        let store = Arc::new(MemoryArtifactStore::new());
        let pipeline = ReportPipeline::new(
            SourceRegistry::from_repository(Arc::new(repo)),
            store,
            PipelineSettings {
                fetch_timeout: Duration::from_millis(20),
                ..PipelineSettings::default()
            },
        );
        let mut job = ReportJob::new(definition(ExportFormat::Csv), None, now());
        let err = pipeline.run(&mut job, &CancelToken::new(), now()).await.unwrap_err();
        assert!(matches!(err, ReportError::Timeout { stage: Stage::Fetch, .. }));
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_job_discards_its_work() {
        let (pipeline, store) = pipeline(seeded());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut job = ReportJob::new(definition(ExportFormat::Csv), None, now());
        let err = pipeline.run(&mut job, &cancel, now()).await.unwrap_err();
        assert!(matches!(err, ReportError::Cancelled { .. }));
        assert_eq!(job.status, JobStatus::Failed);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn aged_filters_fail_revalidation() {
        let (pipeline, _) = pipeline(seeded());
        let mut job = ReportJob::new(definition(ExportFormat::Csv), None, now());
        let later = Utc.with_ymd_and_hms(2027, 6, 1, 0, 0, 0).unwrap();
        let err = pipeline.run(&mut job, &CancelToken::new(), later).await.unwrap_err();
        assert!(matches!(err, ReportError::StaleFilter(_)));
        assert!(job.error_message.unwrap().starts_with("StaleFilter: "));
    }

    #[tokio::test]
    async fn too_many_rows_is_a_render_limit_failure() {
        let repo = MemoryRepository::new();
        for id in 0..1_001 {
            repo.insert_booking(booking(id, "Oak Elementary", 1, 5));
        }
        let (pipeline, _) = pipeline(Arc::new(repo));
        let mut job = ReportJob::new(definition(ExportFormat::Pdf), None, now());
        let err = pipeline.run(&mut job, &CancelToken::new(), now()).await.unwrap_err();
        assert!(matches!(err, ReportError::RenderLimitExceeded { rows: 1_001, max: 1_000, .. }));
    }

    #[test]
    fn grouping_keeps_its_source_column_and_sorting_is_stable() {
        let mut definition = definition(ExportFormat::Csv);
        definition.filter.columns = vec!["school_name".to_string(), "student_count".to_string()];
        definition.aggregation = Some(Aggregation::new(GroupBy::Month, vec![AggregateFn::Sum]));
        let table = crate::source::BookingsSource::to_table(&[
            booking(1, "Oak Elementary", 20, 3),
            booking(2, "Elm Middle", 35, 9),
        ]);
        let today = now().date_naive();
        let document = build_document(&definition, table, today).unwrap();
        assert_eq!(document.table.columns, vec!["period", "school_name", "student_count_sum"]);
        assert_eq!(document.table.rows[0][0], Value::text("2024-01"));
        assert_eq!(document.table.rows[0][2], Value::Int(55));

        let mut sorted = self::definition(ExportFormat::Csv);
        sorted.sort_by = Some("student_count".to_string());
        sorted.limit = Some(2);
        let table = crate::source::BookingsSource::to_table(&[
            booking(1, "Oak Elementary", 20, 3),
            booking(2, "Elm Middle", 35, 9),
            booking(3, "Pine High", 20, 10),
        ]);
        let document = build_document(&sorted, table, today).unwrap();
        let ids: Vec<Value> = document.table.rows.iter().map(|row| row[0].clone()).collect();
        assert_eq!(ids, vec![Value::Int(2), Value::Int(1)]);
    }
}
