//! Postgres persistence: schema setup, seeding, CSV import and the store implementations.

mod repository;
mod stores;

pub use repository::{load_catalog, PgRepository};
pub use stores::{PgJobStore, PgScheduleStore};

use std::path::Path;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::fixtures;

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to DATABASE_URL")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Load the demo dataset, with bookings ending on `last_day`. Safe to run twice.
pub async fn seed(pool: &PgPool, last_day: NaiveDate, booking_count: usize) -> anyhow::Result<usize> {
    let since = last_day - chrono::Duration::days(booking_count.max(1) as i64);

    for (id, name) in fixtures::DISTRICTS {
        sqlx::query(
            r#"
            INSERT INTO spark_reports.districts (id, name)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    }

    for school in fixtures::schools(since) {
        sqlx::query(
            r#"
            INSERT INTO spark_reports.schools
            (id, name, district_id, school_type, city, state, student_count, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, district_id = EXCLUDED.district_id
            "#,
        )
        .bind(school.id)
        .bind(&school.name)
        .bind(school.district_id)
        .bind(&school.school_type)
        .bind(&school.city)
        .bind(&school.state)
        .bind(school.student_count)
        .bind(school.is_active)
        .bind(school.created_at)
        .execute(pool)
        .await?;
    }

    for program in fixtures::programs(since) {
        sqlx::query(
            r#"
            INSERT INTO spark_reports.programs
            (id, title, description, grade_levels, duration_minutes, max_students,
             price_per_student, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title, price_per_student = EXCLUDED.price_per_student
            "#,
        )
        .bind(program.id)
        .bind(&program.title)
        .bind(&program.description)
        .bind(&program.grade_levels)
        .bind(program.duration_minutes)
        .bind(program.max_students)
        .bind(program.price_per_student)
        .bind(program.is_active)
        .bind(program.created_at)
        .execute(pool)
        .await?;
    }

    for user in fixtures::users(since) {
        sqlx::query(
            r#"
            INSERT INTO spark_reports.users (id, name, email, role, school_id, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, role = EXCLUDED.role
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.role)
        .bind(user.school_id)
        .bind(user.is_active)
        .bind(user.created_at)
        .execute(pool)
        .await?;
    }

    let bookings = fixtures::bookings(last_day, booking_count);
    let slips = fixtures::permission_slips(&bookings);
    let mut inserted = 0usize;
    for booking in &bookings {
        let row = sqlx::query(
            r#"
            INSERT INTO spark_reports.bookings
            (booking_reference, school_id, program_id, teacher_id, status, payment_status,
             student_count, total_cost, grade_levels, confirmed_date, payment_due_date,
             created_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (booking_reference) DO UPDATE SET status = EXCLUDED.status
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&booking.booking_reference)
        .bind(booking.school_id)
        .bind(booking.program_id)
        .bind(booking.teacher_id)
        .bind(&booking.status)
        .bind(&booking.payment_status)
        .bind(booking.student_count)
        .bind(booking.total_cost)
        .bind(&booking.grade_levels)
        .bind(booking.confirmed_date)
        .bind(booking.payment_due_date)
        .bind(booking.created_at)
        .bind(booking.deleted.then_some(booking.created_at))
        .fetch_one(pool)
        .await?;

        let booking_id: i64 = row.try_get("id")?;
        if !row.try_get::<bool, _>("inserted")? {
            continue;
        }
        inserted += 1;
        for slip in slips.iter().filter(|slip| slip.booking_id == booking.id) {
            sqlx::query(
                r#"
                INSERT INTO spark_reports.permission_slips
                (booking_id, student_name, parent_name, parent_email, is_signed, signed_at,
                 reminder_sent_count, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(booking_id)
            .bind(&slip.student_name)
            .bind(&slip.parent_name)
            .bind(&slip.parent_email)
            .bind(slip.is_signed)
            .bind(slip.signed_at)
            .bind(slip.reminder_sent_count)
            .bind(slip.created_at)
            .execute(pool)
            .await?;
        }
    }

    info!(bookings = inserted, "demo data seeded");
    Ok(inserted)
}

/// Import bookings from a CSV export of the booking system.
///
/// Rows whose `booking_reference` already exists are skipped. Returns the number inserted.
pub async fn import_bookings(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        booking_reference: String,
        school_id: i64,
        program_id: i64,
        teacher_id: Option<i64>,
        status: String,
        payment_status: String,
        student_count: i32,
        total_cost: f64,
        /// Semicolon separated, e.g. `4;5`.
        grade_levels: Option<String>,
        confirmed_date: Option<NaiveDate>,
        created_at: NaiveDate,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid booking on row {}", line + 2))?;
        let grade_levels: Vec<String> = row
            .grade_levels
            .as_deref()
            .unwrap_or_default()
            .split(';')
            .map(str::trim)
            .filter(|grade| !grade.is_empty())
            .map(str::to_string)
            .collect();
        let created_at: NaiveDateTime = row.created_at.and_hms_opt(0, 0, 0).unwrap_or_default();

        let result = sqlx::query(
            r#"
            INSERT INTO spark_reports.bookings
            (booking_reference, school_id, program_id, teacher_id, status, payment_status,
             student_count, total_cost, grade_levels, confirmed_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (booking_reference) DO NOTHING
            "#,
        )
        .bind(&row.booking_reference)
        .bind(row.school_id)
        .bind(row.program_id)
        .bind(row.teacher_id)
        .bind(&row.status)
        .bind(&row.payment_status)
        .bind(row.student_count)
        .bind(row.total_cost)
        .bind(&grade_levels)
        .bind(row.confirmed_date)
        .bind(created_at)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    info!(inserted, path = %csv_path.display(), "bookings imported");
    Ok(inserted)
}
