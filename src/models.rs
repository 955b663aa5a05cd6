use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Entity family an export reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bookings,
    Programs,
    Schools,
    Financial,
    PermissionSlips,
    Users,
    AnalyticsSummary,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::Bookings,
        DataType::Programs,
        DataType::Schools,
        DataType::Financial,
        DataType::PermissionSlips,
        DataType::Users,
        DataType::AnalyticsSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Bookings => "bookings",
            DataType::Programs => "programs",
            DataType::Schools => "schools",
            DataType::Financial => "financial",
            DataType::PermissionSlips => "permission_slips",
            DataType::Users => "users",
            DataType::AnalyticsSummary => "analytics_summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Excel,
    Pdf,
    Json,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::Csv,
        ExportFormat::Excel,
        ExportFormat::Pdf,
        ExportFormat::Json,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "excel",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Json => "json",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }

    /// Largest row count a single artifact of this format may hold.
    pub fn max_rows(self) -> usize {
        match self {
            ExportFormat::Csv => 50_000,
            ExportFormat::Excel => 10_000,
            ExportFormat::Pdf => 1_000,
            ExportFormat::Json => 25_000,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "xls",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Excel => "application/vnd.ms-excel",
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Json => "application/json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canned analytics reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    BookingSummary,
    ProgramPerformance,
    SchoolEngagement,
    FinancialSummary,
    PermissionSlipCompliance,
}

impl ReportType {
    pub const ALL: [ReportType; 5] = [
        ReportType::BookingSummary,
        ReportType::ProgramPerformance,
        ReportType::SchoolEngagement,
        ReportType::FinancialSummary,
        ReportType::PermissionSlipCompliance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportType::BookingSummary => "booking_summary",
            ReportType::ProgramPerformance => "program_performance",
            ReportType::SchoolEngagement => "school_engagement",
            ReportType::FinancialSummary => "financial_summary",
            ReportType::PermissionSlipCompliance => "permission_slip_compliance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }

    pub fn data_type(self) -> DataType {
        match self {
            ReportType::BookingSummary => DataType::Bookings,
            ReportType::ProgramPerformance => DataType::Programs,
            ReportType::SchoolEngagement => DataType::Schools,
            ReportType::FinancialSummary => DataType::Financial,
            ReportType::PermissionSlipCompliance => DataType::PermissionSlips,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ReportType::BookingSummary => "Booking Summary Report",
            ReportType::ProgramPerformance => "Program Performance Report",
            ReportType::SchoolEngagement => "School Engagement Report",
            ReportType::FinancialSummary => "Financial Summary Report",
            ReportType::PermissionSlipCompliance => "Permission Slip Compliance Report",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingRecord {
    pub id: i64,
    pub booking_reference: String,
    pub school_id: i64,
    pub school_name: String,
    pub district_id: Option<i64>,
    pub program_id: i64,
    pub program_title: String,
    pub teacher_id: Option<i64>,
    pub teacher_name: String,
    pub status: String,
    pub payment_status: String,
    pub student_count: i32,
    pub total_cost: f64,
    pub grade_levels: Vec<String>,
    pub confirmed_date: Option<NaiveDate>,
    pub payment_due_date: Option<NaiveDate>,
    pub created_at: NaiveDateTime,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramRecord {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub grade_levels: Vec<String>,
    pub duration_minutes: i32,
    pub max_students: i32,
    pub price_per_student: f64,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchoolRecord {
    pub id: i64,
    pub name: String,
    pub district_id: Option<i64>,
    pub district_name: String,
    pub school_type: String,
    pub city: String,
    pub state: String,
    pub student_count: i32,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionSlipRecord {
    pub id: i64,
    pub booking_id: i64,
    pub booking_reference: String,
    pub school_id: i64,
    pub district_id: Option<i64>,
    pub program_id: i64,
    pub student_name: String,
    pub parent_name: String,
    pub parent_email: String,
    pub is_signed: bool,
    pub signed_at: Option<NaiveDateTime>,
    pub reminder_sent_count: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: String,
    pub school_id: Option<i64>,
    pub school_name: Option<String>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}
