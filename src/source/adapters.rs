use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{
    columns, BookingRepository, DataSource, FetchRequest, PermissionSlipRepository,
    ProgramRepository, SchoolRepository, UserRepository,
};
use crate::error::ReportResult;
use crate::models::{
    BookingRecord, DataType, PermissionSlipRecord, ProgramRecord, ReportType, SchoolRecord,
    UserRecord,
};
use crate::report;
use crate::table::{Table, Value};

fn table_for(data_type: DataType) -> Table {
    Table::new(columns::valid_columns(data_type).iter().copied())
}

pub struct BookingsSource {
    repo: Arc<dyn BookingRepository>,
}

impl BookingsSource {
    pub fn new(repo: Arc<dyn BookingRepository>) -> Self {
        Self { repo }
    }

    pub fn to_table(records: &[BookingRecord]) -> Table {
        let mut table = table_for(DataType::Bookings);
        for booking in records {
            table.push(vec![
                booking.id.into(),
                booking.booking_reference.as_str().into(),
                booking.school_name.as_str().into(),
                booking.program_title.as_str().into(),
                booking.teacher_name.as_str().into(),
                booking.status.as_str().into(),
                booking.student_count.into(),
                booking.total_cost.into(),
                booking.confirmed_date.into(),
                booking.created_at.into(),
            ]);
        }
        table
    }
}

#[async_trait]
impl DataSource for BookingsSource {
    fn data_type(&self) -> DataType {
        DataType::Bookings
    }

    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table> {
        let records = self.repo.bookings(&request.query, request.limit).await?;
        debug!(rows = records.len(), "fetched bookings");
        Ok(Self::to_table(&records))
    }
}

pub struct FinancialSource {
    repo: Arc<dyn BookingRepository>,
}

impl FinancialSource {
    pub fn new(repo: Arc<dyn BookingRepository>) -> Self {
        Self { repo }
    }

    pub fn to_table(records: &[BookingRecord]) -> Table {
        let mut table = table_for(DataType::Financial);
        for booking in records {
            table.push(vec![
                booking.id.into(),
                booking.school_name.as_str().into(),
                booking.program_title.as_str().into(),
                booking.total_cost.into(),
                booking.payment_status.as_str().into(),
                booking.payment_due_date.into(),
                booking.confirmed_date.into(),
            ]);
        }
        table
    }
}

#[async_trait]
impl DataSource for FinancialSource {
    fn data_type(&self) -> DataType {
        DataType::Financial
    }

    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table> {
        let records = self.repo.bookings(&request.query, request.limit).await?;
        debug!(rows = records.len(), "fetched financial rows");
        Ok(Self::to_table(&records))
    }
}

pub struct ProgramsSource {
    repo: Arc<dyn ProgramRepository>,
}

impl ProgramsSource {
    pub fn new(repo: Arc<dyn ProgramRepository>) -> Self {
        Self { repo }
    }

    pub fn to_table(records: &[ProgramRecord]) -> Table {
        let mut table = table_for(DataType::Programs);
        for program in records {
            table.push(vec![
                program.id.into(),
                program.title.as_str().into(),
                program.description.as_str().into(),
                program.grade_levels.join(", ").into(),
                program.duration_minutes.into(),
                program.max_students.into(),
                program.price_per_student.into(),
                program.is_active.into(),
                program.created_at.into(),
            ]);
        }
        table
    }
}

#[async_trait]
impl DataSource for ProgramsSource {
    fn data_type(&self) -> DataType {
        DataType::Programs
    }

    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table> {
        let records = self.repo.programs(&request.query, request.limit).await?;
        Ok(Self::to_table(&records))
    }
}

pub struct SchoolsSource {
    repo: Arc<dyn SchoolRepository>,
}

impl SchoolsSource {
    pub fn new(repo: Arc<dyn SchoolRepository>) -> Self {
        Self { repo }
    }

    pub fn to_table(records: &[SchoolRecord]) -> Table {
        let mut table = table_for(DataType::Schools);
        for school in records {
            table.push(vec![
                school.id.into(),
                school.name.as_str().into(),
                school.district_name.as_str().into(),
                school.school_type.as_str().into(),
                school.city.as_str().into(),
                school.state.as_str().into(),
                school.student_count.into(),
                school.is_active.into(),
                school.created_at.into(),
            ]);
        }
        table
    }
}

#[async_trait]
impl DataSource for SchoolsSource {
    fn data_type(&self) -> DataType {
        DataType::Schools
    }

    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table> {
        let records = self.repo.schools(&request.query, request.limit).await?;
        Ok(Self::to_table(&records))
    }
}

pub struct PermissionSlipsSource {
    repo: Arc<dyn PermissionSlipRepository>,
}

impl PermissionSlipsSource {
    pub fn new(repo: Arc<dyn PermissionSlipRepository>) -> Self {
        Self { repo }
    }

    pub fn to_table(records: &[PermissionSlipRecord]) -> Table {
        let mut table = table_for(DataType::PermissionSlips);
        for slip in records {
            table.push(vec![
                slip.id.into(),
                slip.booking_reference.as_str().into(),
                slip.student_name.as_str().into(),
                slip.parent_name.as_str().into(),
                slip.parent_email.as_str().into(),
                slip.is_signed.into(),
                slip.signed_at.into(),
                slip.reminder_sent_count.into(),
                slip.created_at.into(),
            ]);
        }
        table
    }
}

#[async_trait]
impl DataSource for PermissionSlipsSource {
    fn data_type(&self) -> DataType {
        DataType::PermissionSlips
    }

    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table> {
        let records = self
            .repo
            .permission_slips(&request.query, request.limit)
            .await?;
        Ok(Self::to_table(&records))
    }
}

pub struct UsersSource {
    repo: Arc<dyn UserRepository>,
}

impl UsersSource {
    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }

    pub fn to_table(records: &[UserRecord]) -> Table {
        let mut table = table_for(DataType::Users);
        for user in records {
            table.push(vec![
                user.id.into(),
                user.name.as_str().into(),
                user.email.as_str().into(),
                user.role.as_str().into(),
                user.school_name.clone().into(),
                user.is_active.into(),
                user.created_at.into(),
            ]);
        }
        table
    }
}

#[async_trait]
impl DataSource for UsersSource {
    fn data_type(&self) -> DataType {
        DataType::Users
    }

    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table> {
        let records = self.repo.users(&request.query, request.limit).await?;
        Ok(Self::to_table(&records))
    }
}

/// One `metric, value` row per headline figure across bookings and permission slips.
pub struct AnalyticsSummarySource {
    bookings: Arc<dyn BookingRepository>,
    slips: Arc<dyn PermissionSlipRepository>,
}

impl AnalyticsSummarySource {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        slips: Arc<dyn PermissionSlipRepository>,
    ) -> Self {
        Self { bookings, slips }
    }
}

#[async_trait]
impl DataSource for AnalyticsSummarySource {
    fn data_type(&self) -> DataType {
        DataType::AnalyticsSummary
    }

    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table> {
        let bookings = self.bookings.bookings(&request.query, None).await?;
        let slips = self.slips.permission_slips(&request.query, None).await?;

        let sections = [
            (ReportType::BookingSummary, BookingsSource::to_table(&bookings)),
            (ReportType::FinancialSummary, FinancialSource::to_table(&bookings)),
            (
                ReportType::PermissionSlipCompliance,
                PermissionSlipsSource::to_table(&slips),
            ),
        ];

        let mut table = table_for(DataType::AnalyticsSummary);
        for (report_type, source) in sections {
            for item in report::summarize(report_type, &source) {
                table.push(vec![Value::Text(item.label), item.value]);
            }
        }
        if let Some(limit) = request.limit {
            table.truncate(limit);
        }
        Ok(table)
    }
}
