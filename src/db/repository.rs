use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::error::ReportResult;
use crate::filter::{DateBounds, RecordQuery, StaticCatalog};
use crate::models::{
    BookingRecord, PermissionSlipRecord, ProgramRecord, SchoolRecord, UserRecord,
};
use crate::source::{
    BookingRepository, PermissionSlipRepository, ProgramRepository, SchoolRepository,
    UserRepository,
};

/// Domain reads for every data type, filtered in SQL.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_dates(builder: &mut QueryBuilder<'_, Postgres>, column: &str, dates: &DateBounds) {
    if let Some(start) = dates.start {
        builder.push(format!(" AND {column}::date >= ")).push_bind(start);
    }
    if let Some(end) = dates.end {
        builder.push(format!(" AND {column}::date <= ")).push_bind(end);
    }
}

fn push_eq(builder: &mut QueryBuilder<'_, Postgres>, column: &str, value: Option<i64>) {
    if let Some(value) = value {
        builder.push(format!(" AND {column} = ")).push_bind(value);
    }
}

fn push_any(builder: &mut QueryBuilder<'_, Postgres>, column: &str, values: &[String]) {
    if !values.is_empty() {
        builder
            .push(format!(" AND {column} = ANY("))
            .push_bind(values.to_vec())
            .push(")");
    }
}

fn push_overlap(builder: &mut QueryBuilder<'_, Postgres>, column: &str, values: &[String]) {
    if !values.is_empty() {
        builder
            .push(format!(" AND {column} && "))
            .push_bind(values.to_vec());
    }
}

fn push_students(builder: &mut QueryBuilder<'_, Postgres>, column: &str, query: &RecordQuery) {
    if let Some(min) = query.bounds.min_students {
        builder.push(format!(" AND {column} >= ")).push_bind(min);
    }
    if let Some(max) = query.bounds.max_students {
        builder.push(format!(" AND {column} <= ")).push_bind(max);
    }
}

fn push_limit(builder: &mut QueryBuilder<'_, Postgres>, order_by: &str, limit: Option<usize>) {
    builder.push(format!(" ORDER BY {order_by}"));
    if let Some(limit) = limit {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }
}

fn booking(row: &PgRow) -> Result<BookingRecord, sqlx::Error> {
    Ok(BookingRecord {
        id: row.try_get("id")?,
        booking_reference: row.try_get("booking_reference")?,
        school_id: row.try_get("school_id")?,
        school_name: row.try_get("school_name")?,
        district_id: row.try_get("district_id")?,
        program_id: row.try_get("program_id")?,
        program_title: row.try_get("program_title")?,
        teacher_id: row.try_get("teacher_id")?,
        teacher_name: row.try_get("teacher_name")?,
        status: row.try_get("status")?,
        payment_status: row.try_get("payment_status")?,
        student_count: row.try_get("student_count")?,
        total_cost: row.try_get("total_cost")?,
        grade_levels: row.try_get("grade_levels")?,
        confirmed_date: row.try_get("confirmed_date")?,
        payment_due_date: row.try_get("payment_due_date")?,
        created_at: row.try_get("created_at")?,
        deleted: row.try_get("deleted")?,
    })
}

#[async_trait]
impl BookingRepository for PgRepository {
    async fn bookings(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<BookingRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT b.id, b.booking_reference, b.school_id, s.name AS school_name, s.district_id, \
             b.program_id, p.title AS program_title, b.teacher_id, \
             COALESCE(u.name, '') AS teacher_name, b.status, b.payment_status, b.student_count, \
             b.total_cost, b.grade_levels, b.confirmed_date, b.payment_due_date, b.created_at, \
             (b.deleted_at IS NOT NULL) AS deleted \
             FROM spark_reports.bookings b \
             JOIN spark_reports.schools s ON s.id = b.school_id \
             JOIN spark_reports.programs p ON p.id = b.program_id \
             LEFT JOIN spark_reports.users u ON u.id = b.teacher_id \
             WHERE TRUE",
        );
        if !query.status.include_deleted {
            builder.push(" AND b.deleted_at IS NULL");
        }
        push_dates(&mut builder, "b.created_at", &query.dates);
        push_eq(&mut builder, "b.school_id", query.scope.school_id);
        push_eq(&mut builder, "s.district_id", query.scope.district_id);
        push_eq(&mut builder, "b.program_id", query.scope.program_id);
        push_eq(&mut builder, "b.teacher_id", query.scope.teacher_id);
        if query.status.include_cancelled == Some(false) {
            builder.push(" AND b.status <> 'cancelled'");
        }
        push_any(&mut builder, "b.status", &query.status.booking_status);
        push_any(&mut builder, "b.payment_status", &query.status.payment_status);
        push_overlap(&mut builder, "b.grade_levels", &query.status.grade_levels);
        push_students(&mut builder, "b.student_count", query);
        if let Some(min) = query.bounds.min_revenue {
            builder.push(" AND b.total_cost >= ").push_bind(min);
        }
        if let Some(max) = query.bounds.max_revenue {
            builder.push(" AND b.total_cost <= ").push_bind(max);
        }
        push_limit(&mut builder, "b.id", limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(booking).collect::<Result<_, _>>()?)
    }
}

#[async_trait]
impl ProgramRepository for PgRepository {
    async fn programs(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<ProgramRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT id, title, description, grade_levels, duration_minutes, max_students, \
             price_per_student, is_active, created_at \
             FROM spark_reports.programs WHERE TRUE",
        );
        push_dates(&mut builder, "created_at", &query.dates);
        push_eq(&mut builder, "id", query.scope.program_id);
        push_overlap(&mut builder, "grade_levels", &query.status.grade_levels);
        push_limit(&mut builder, "id", limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut programs = Vec::with_capacity(rows.len());
        for row in rows {
            programs.push(ProgramRecord {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                description: row.try_get("description")?,
                grade_levels: row.try_get("grade_levels")?,
                duration_minutes: row.try_get("duration_minutes")?,
                max_students: row.try_get("max_students")?,
                price_per_student: row.try_get("price_per_student")?,
                is_active: row.try_get("is_active")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(programs)
    }
}

#[async_trait]
impl SchoolRepository for PgRepository {
    async fn schools(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<SchoolRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT s.id, s.name, s.district_id, COALESCE(d.name, '') AS district_name, \
             s.school_type, s.city, s.state, s.student_count, s.is_active, s.created_at \
             FROM spark_reports.schools s \
             LEFT JOIN spark_reports.districts d ON d.id = s.district_id \
             WHERE TRUE",
        );
        push_dates(&mut builder, "s.created_at", &query.dates);
        push_eq(&mut builder, "s.id", query.scope.school_id);
        push_eq(&mut builder, "s.district_id", query.scope.district_id);
        push_students(&mut builder, "s.student_count", query);
        push_limit(&mut builder, "s.id", limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut schools = Vec::with_capacity(rows.len());
        for row in rows {
            schools.push(SchoolRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                district_id: row.try_get("district_id")?,
                district_name: row.try_get("district_name")?,
                school_type: row.try_get("school_type")?,
                city: row.try_get("city")?,
                state: row.try_get("state")?,
                student_count: row.try_get("student_count")?,
                is_active: row.try_get("is_active")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(schools)
    }
}

#[async_trait]
impl PermissionSlipRepository for PgRepository {
    async fn permission_slips(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<PermissionSlipRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT ps.id, ps.booking_id, b.booking_reference, b.school_id, s.district_id, \
             b.program_id, ps.student_name, ps.parent_name, ps.parent_email, ps.is_signed, \
             ps.signed_at, ps.reminder_sent_count, ps.created_at \
             FROM spark_reports.permission_slips ps \
             JOIN spark_reports.bookings b ON b.id = ps.booking_id \
             JOIN spark_reports.schools s ON s.id = b.school_id \
             WHERE TRUE",
        );
        push_dates(&mut builder, "ps.created_at", &query.dates);
        push_eq(&mut builder, "b.school_id", query.scope.school_id);
        push_eq(&mut builder, "s.district_id", query.scope.district_id);
        push_eq(&mut builder, "b.program_id", query.scope.program_id);
        push_limit(&mut builder, "ps.id", limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut slips = Vec::with_capacity(rows.len());
        for row in rows {
            slips.push(PermissionSlipRecord {
                id: row.try_get("id")?,
                booking_id: row.try_get("booking_id")?,
                booking_reference: row.try_get("booking_reference")?,
                school_id: row.try_get("school_id")?,
                district_id: row.try_get("district_id")?,
                program_id: row.try_get("program_id")?,
                student_name: row.try_get("student_name")?,
                parent_name: row.try_get("parent_name")?,
                parent_email: row.try_get("parent_email")?,
                is_signed: row.try_get("is_signed")?,
                signed_at: row.try_get("signed_at")?,
                reminder_sent_count: row.try_get("reminder_sent_count")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(slips)
    }
}

#[async_trait]
impl UserRepository for PgRepository {
    async fn users(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<UserRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT u.id, u.name, u.email, u.role, u.school_id, s.name AS school_name, \
             u.is_active, u.created_at \
             FROM spark_reports.users u \
             LEFT JOIN spark_reports.schools s ON s.id = u.school_id \
             WHERE TRUE",
        );
        push_dates(&mut builder, "u.created_at", &query.dates);
        push_eq(&mut builder, "u.school_id", query.scope.school_id);
        push_eq(&mut builder, "u.id", query.scope.teacher_id);
        push_limit(&mut builder, "u.id", limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(UserRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                role: row.try_get("role")?,
                school_id: row.try_get("school_id")?,
                school_name: row.try_get("school_name")?,
                is_active: row.try_get("is_active")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(users)
    }
}

/// Snapshot of the reference ids request validation checks against.
pub async fn load_catalog(pool: &PgPool) -> ReportResult<StaticCatalog> {
    let mut catalog = StaticCatalog::new();

    for row in sqlx::query("SELECT id FROM spark_reports.districts")
        .fetch_all(pool)
        .await?
    {
        catalog = catalog.with_district(row.try_get("id")?);
    }
    for row in sqlx::query("SELECT id, district_id FROM spark_reports.schools")
        .fetch_all(pool)
        .await?
    {
        catalog = catalog.with_school(row.try_get("id")?, row.try_get("district_id")?);
    }
    for row in sqlx::query("SELECT id FROM spark_reports.programs")
        .fetch_all(pool)
        .await?
    {
        catalog = catalog.with_program(row.try_get("id")?);
    }
    for row in sqlx::query("SELECT id FROM spark_reports.users WHERE role = 'teacher'")
        .fetch_all(pool)
        .await?
    {
        catalog = catalog.with_teacher(row.try_get("id")?);
    }

    Ok(catalog)
}
