//! Normalised, validated report filters.
//!
//! A `FilterSpecification` is built once per request by the validators in
//! `crate::request` and is immutable afterwards. It travels inside the job
//! record and is checked again when the job starts running.

mod context;

pub use context::{ReferenceCatalog, StaticCatalog, ValidationContext};

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::models::{
    BookingRecord, DataType, PermissionSlipRecord, ProgramRecord, SchoolRecord, UserRecord,
};
use crate::source::columns;

pub const BOOKING_STATUSES: [&str; 4] = ["pending", "confirmed", "cancelled", "completed"];
pub const PAYMENT_STATUSES: [&str; 4] = ["pending", "paid", "overdue", "cancelled"];
pub const GRADE_LEVELS: [&str; 13] = [
    "K", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12",
];

/// Longest fixed range accepted for exports.
pub const EXPORT_MAX_SPAN_DAYS: i64 = 1095;
/// Longest fixed range accepted for generated and scheduled reports.
pub const REPORT_MAX_SPAN_DAYS: i64 = 730;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativePeriod {
    Week,
    Month,
    Quarter,
    Year,
    MonthToDate,
    YearToDate,
}

impl RelativePeriod {
    /// Accepts both the short (`month`) and the schedule (`last_month`) spellings.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "week" | "last_week" => Some(RelativePeriod::Week),
            "month" | "last_month" => Some(RelativePeriod::Month),
            "quarter" | "last_quarter" => Some(RelativePeriod::Quarter),
            "year" | "last_year" => Some(RelativePeriod::Year),
            "month_to_date" => Some(RelativePeriod::MonthToDate),
            "year_to_date" => Some(RelativePeriod::YearToDate),
            _ => None,
        }
    }

    pub fn start(self, today: NaiveDate) -> NaiveDate {
        let months_back = |months: u32| {
            today
                .checked_sub_months(Months::new(months))
                .unwrap_or(today)
        };
        match self {
            RelativePeriod::Week => today - Duration::days(7),
            RelativePeriod::Month => months_back(1),
            RelativePeriod::Quarter => months_back(3),
            RelativePeriod::Year => months_back(12),
            RelativePeriod::MonthToDate => today.with_day(1).unwrap_or(today),
            RelativePeriod::YearToDate => today.with_ordinal(1).unwrap_or(today),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RelativePeriod::Week => "Last 7 days",
            RelativePeriod::Month => "Last 30 days",
            RelativePeriod::Quarter => "Last 90 days",
            RelativePeriod::Year => "Last 365 days",
            RelativePeriod::MonthToDate => "Month to date",
            RelativePeriod::YearToDate => "Year to date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DateRange {
    /// No date constraint.
    All,
    Relative { period: RelativePeriod },
    /// At least one bound is present; `start <= end` when both are.
    Fixed {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

impl DateRange {
    pub fn resolve(&self, today: NaiveDate) -> DateBounds {
        match self {
            DateRange::All => DateBounds::default(),
            DateRange::Relative { period } => DateBounds {
                start: Some(period.start(today)),
                end: Some(today),
            },
            DateRange::Fixed { start, end } => DateBounds {
                start: *start,
                end: *end,
            },
        }
    }

    /// Human label used in report headers.
    pub fn label(&self) -> String {
        match self {
            DateRange::All => "All time".to_string(),
            DateRange::Relative { period } => period.label().to_string(),
            DateRange::Fixed { start, end } => {
                let fmt = |date: &NaiveDate| date.format("%b %-d, %Y").to_string();
                match (start, end) {
                    (Some(start), Some(end)) => format!("{} - {}", fmt(start), fmt(end)),
                    (Some(start), None) => format!("Since {}", fmt(start)),
                    (None, Some(end)) => format!("Until {}", fmt(end)),
                    (None, None) => "All time".to_string(),
                }
            }
        }
    }
}

/// A fixed range starting more than `max_span_days` before `today` has aged out.
///
/// Checked when a request is validated and again when its job starts running.
pub fn range_age_error(start: NaiveDate, today: NaiveDate, max_span_days: i64) -> Option<String> {
    ((today - start).num_days() > max_span_days)
        .then(|| format!("Date range starts more than {max_span_days} days before today."))
}

/// Inclusive calendar bounds of a resolved date range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateBounds {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateBounds {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date <= end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilters {
    pub school_id: Option<i64>,
    pub district_id: Option<i64>,
    pub program_id: Option<i64>,
    pub teacher_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFilters {
    pub booking_status: Vec<String>,
    pub payment_status: Vec<String>,
    pub grade_levels: Vec<String>,
    pub include_cancelled: Option<bool>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericBounds {
    pub min_students: Option<i64>,
    pub max_students: Option<i64>,
    pub min_revenue: Option<f64>,
    pub max_revenue: Option<f64>,
}

impl NumericBounds {
    fn students_match(&self, count: i64) -> bool {
        self.min_students.map_or(true, |min| count >= min)
            && self.max_students.map_or(true, |max| count <= max)
    }

    fn revenue_match(&self, amount: f64) -> bool {
        self.min_revenue.map_or(true, |min| amount >= min)
            && self.max_revenue.map_or(true, |max| amount <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpecification {
    pub data_type: DataType,
    pub date_range: DateRange,
    /// Span ceiling this spec was validated against.
    pub max_span_days: i64,
    #[serde(default)]
    pub scope: ScopeFilters,
    #[serde(default)]
    pub status: StatusFilters,
    #[serde(default)]
    pub bounds: NumericBounds,
    /// Requested output columns; empty means the data type's default set.
    #[serde(default)]
    pub columns: Vec<String>,
}

impl FilterSpecification {
    pub fn new(data_type: DataType, date_range: DateRange, max_span_days: i64) -> Self {
        Self {
            data_type,
            date_range,
            max_span_days,
            scope: ScopeFilters::default(),
            status: StatusFilters::default(),
            bounds: NumericBounds::default(),
            columns: Vec::new(),
        }
    }

    /// Columns the output should carry, in order.
    pub fn output_columns(&self) -> Vec<String> {
        if self.columns.is_empty() {
            columns::default_columns(self.data_type)
                .iter()
                .map(|column| column.to_string())
                .collect()
        } else {
            self.columns.clone()
        }
    }

    pub fn query(&self, today: NaiveDate) -> RecordQuery {
        RecordQuery {
            dates: self.date_range.resolve(today),
            scope: self.scope.clone(),
            status: self.status.clone(),
            bounds: self.bounds.clone(),
        }
    }

    /// Re-check invariants that may have decayed while the spec sat in storage.
    pub fn revalidate(&self, today: NaiveDate) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let DateRange::Fixed { start, end } = &self.date_range {
            if let (Some(start), Some(end)) = (start, end) {
                if start > end {
                    errors.add("filters.start_date", "Start date must be before or equal to end date.");
                    errors.add("filters.end_date", "End date must be after or equal to start date.");
                } else if (*end - *start).num_days() > self.max_span_days {
                    errors.add(
                        "filters.end_date",
                        format!("Date range cannot exceed {} days.", self.max_span_days),
                    );
                }
            }
            if let Some(message) =
                start.and_then(|start| range_age_error(start, today, self.max_span_days))
            {
                errors.add("filters.start_date", message);
            }
        }

        if let (Some(min), Some(max)) = (self.bounds.min_students, self.bounds.max_students) {
            if min > max {
                errors.add(
                    "filters.max_students",
                    "Maximum students must be greater than or equal to minimum students.",
                );
            }
        }
        if let (Some(min), Some(max)) = (self.bounds.min_revenue, self.bounds.max_revenue) {
            if min > max {
                errors.add(
                    "filters.max_revenue",
                    "Maximum revenue must be greater than or equal to minimum revenue.",
                );
            }
        }

        let invalid = columns::invalid_columns(self.data_type, &self.columns);
        if !invalid.is_empty() {
            errors.add(
                "columns",
                format!(
                    "Invalid columns for {} data type: {}",
                    self.data_type,
                    invalid.join(", ")
                ),
            );
        }

        errors.into_result(())
    }
}

/// Resolved filter handed to repositories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub dates: DateBounds,
    pub scope: ScopeFilters,
    pub status: StatusFilters,
    pub bounds: NumericBounds,
}

impl RecordQuery {
    pub fn matches_booking(&self, booking: &BookingRecord) -> bool {
        if booking.deleted && !self.status.include_deleted {
            return false;
        }
        if !self.dates.contains(booking.created_at.date()) {
            return false;
        }
        if !id_matches(self.scope.school_id, Some(booking.school_id))
            || !id_matches(self.scope.district_id, booking.district_id)
            || !id_matches(self.scope.program_id, Some(booking.program_id))
            || !id_matches(self.scope.teacher_id, booking.teacher_id)
        {
            return false;
        }
        if self.status.include_cancelled == Some(false) && booking.status == "cancelled" {
            return false;
        }
        if !self.status.booking_status.is_empty()
            && !self.status.booking_status.contains(&booking.status)
        {
            return false;
        }
        if !self.status.payment_status.is_empty()
            && !self.status.payment_status.contains(&booking.payment_status)
        {
            return false;
        }
        if !grades_overlap(&self.status.grade_levels, &booking.grade_levels) {
            return false;
        }
        self.bounds.students_match(i64::from(booking.student_count))
            && self.bounds.revenue_match(booking.total_cost)
    }

    pub fn matches_program(&self, program: &ProgramRecord) -> bool {
        self.dates.contains(program.created_at.date())
            && id_matches(self.scope.program_id, Some(program.id))
            && grades_overlap(&self.status.grade_levels, &program.grade_levels)
    }

    pub fn matches_school(&self, school: &SchoolRecord) -> bool {
        self.dates.contains(school.created_at.date())
            && id_matches(self.scope.school_id, Some(school.id))
            && id_matches(self.scope.district_id, school.district_id)
            && self.bounds.students_match(i64::from(school.student_count))
    }

    pub fn matches_slip(&self, slip: &PermissionSlipRecord) -> bool {
        self.dates.contains(slip.created_at.date())
            && id_matches(self.scope.school_id, Some(slip.school_id))
            && id_matches(self.scope.district_id, slip.district_id)
            && id_matches(self.scope.program_id, Some(slip.program_id))
    }

    pub fn matches_user(&self, user: &UserRecord) -> bool {
        self.dates.contains(user.created_at.date())
            && id_matches(self.scope.school_id, user.school_id)
            && id_matches(self.scope.teacher_id, Some(user.id))
    }
}

fn id_matches(wanted: Option<i64>, actual: Option<i64>) -> bool {
    match wanted {
        Some(wanted) => actual == Some(wanted),
        None => true,
    }
}

fn grades_overlap(wanted: &[String], actual: &[String]) -> bool {
    wanted.is_empty() || wanted.iter().any(|grade| actual.contains(grade))
}
