use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{ReportError, ReportResult};
use crate::job::ReportJob;
use crate::schedule::Schedule;
use crate::store::{JobListQuery, JobStore, Page, ScheduleStore};

/// Jobs stored as JSONB, with the listing columns broken out.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_listing_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &JobListQuery) {
    builder.push(" WHERE TRUE");
    if let Some(label) = &query.report_type {
        builder.push(" AND type_label = ").push_bind(label.clone());
    }
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &ReportJob) -> ReportResult<()> {
        sqlx::query(
            r#"
            INSERT INTO spark_reports.report_jobs
            (id, type_label, status, schedule_id, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id)
        .bind(job.definition.type_label())
        .bind(job.status.as_str())
        .bind(job.schedule_id)
        .bind(Json(job))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, job: &ReportJob) -> ReportResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE spark_reports.report_jobs
            SET status = $2, record = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(Json(job))
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ReportError::NotFound(format!("report job {}", job.id)));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ReportResult<Option<ReportJob>> {
        let row = sqlx::query("SELECT record FROM spark_reports.report_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Json<ReportJob>, _>("record")?.0)),
            None => Ok(None),
        }
    }

    async fn list(&self, query: &JobListQuery) -> ReportResult<Page<ReportJob>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM spark_reports.report_jobs");
        push_listing_filters(&mut count, query);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get(0)?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT record FROM spark_reports.report_jobs");
        push_listing_filters(&mut select, query);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(query.per_page as i64)
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let rows = select.build().fetch_all(&self.pool).await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(row.try_get::<Json<ReportJob>, _>("record")?.0);
        }
        Ok(Page::new(jobs, query, total as usize))
    }

    async fn delete(&self, id: Uuid) -> ReportResult<bool> {
        let result = sqlx::query("DELETE FROM spark_reports.report_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn insert(&self, schedule: &Schedule) -> ReportResult<()> {
        sqlx::query(
            r#"
            INSERT INTO spark_reports.report_schedules
            (id, title, is_active, trigger_at, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.title)
        .bind(schedule.definition.is_active)
        .bind(schedule.trigger_at())
        .bind(Json(schedule))
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, schedule: &Schedule) -> ReportResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE spark_reports.report_schedules
            SET title = $2, is_active = $3, trigger_at = $4, record = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.title)
        .bind(schedule.definition.is_active)
        .bind(schedule.trigger_at())
        .bind(Json(schedule))
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ReportError::NotFound(format!("schedule {}", schedule.id)));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ReportResult<Option<Schedule>> {
        let row = sqlx::query("SELECT record FROM spark_reports.report_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Json<Schedule>, _>("record")?.0)),
            None => Ok(None),
        }
    }

    async fn due(&self, now: DateTime<Utc>) -> ReportResult<Vec<Schedule>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM spark_reports.report_schedules
            WHERE is_active AND trigger_at <= $1
            ORDER BY trigger_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let schedule = row.try_get::<Json<Schedule>, _>("record")?.0;
            // End dates and execution caps are evaluated in the schedule's own timezone.
            if schedule.is_due(now) {
                due.push(schedule);
            }
        }
        Ok(due)
    }
}
