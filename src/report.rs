use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::models::ReportType;
use crate::table::{Table, Value};

/// One headline figure in a report's summary section.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryItem {
    pub label: String,
    pub value: Value,
}

impl SummaryItem {
    fn new(label: &str, value: impl Into<Value>) -> Self {
        Self {
            label: label.to_string(),
            value: value.into(),
        }
    }
}

/// Everything a renderer needs to produce an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDocument {
    pub title: String,
    pub description: Option<String>,
    /// Last day covered by the data. Wall-clock generation time stays on the job.
    pub as_of: NaiveDate,
    pub period: String,
    /// Empty for plain exports.
    pub summary: Vec<SummaryItem>,
    pub table: Table,
}

impl ReportDocument {
    pub fn export(title: impl Into<String>, as_of: NaiveDate, period: String, table: Table) -> Self {
        Self {
            title: title.into(),
            description: None,
            as_of,
            period,
            summary: Vec::new(),
            table,
        }
    }

    pub fn is_report(&self) -> bool {
        !self.summary.is_empty()
    }
}

/// Count rows per distinct value of `column`.
pub fn count_by(table: &Table, column: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    if let Some(index) = table.column_index(column) {
        for row in &table.rows {
            *counts.entry(row[index].display()).or_insert(0) += 1;
        }
    }
    counts
}

fn column_values<'a>(table: &'a Table, column: &str) -> impl Iterator<Item = &'a Value> + 'a {
    let index = table.column_index(column);
    table
        .rows
        .iter()
        .filter_map(move |row| index.map(|index| &row[index]))
}

fn sum(table: &Table, column: &str) -> f64 {
    column_values(table, column).filter_map(Value::as_f64).sum()
}

fn average(table: &Table, column: &str) -> f64 {
    let values: Vec<f64> = column_values(table, column).filter_map(Value::as_f64).collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn rate(part: usize, total: usize) -> String {
    if total == 0 {
        "0.0%".to_string()
    } else {
        format!("{:.1}%", part as f64 * 100.0 / total as f64)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `1234.5` -> `$1,234.50`.
pub fn format_currency(amount: f64) -> String {
    let negative = amount < 0.0;
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    format!("{}${}.{:02}", if negative { "-" } else { "" }, grouped, cents % 100)
}

/// Headline figures for `report_type`, computed from its source table.
pub fn summarize(report_type: ReportType, table: &Table) -> Vec<SummaryItem> {
    let total = table.len();
    match report_type {
        ReportType::BookingSummary => {
            let statuses = count_by(table, "status");
            let status = |name: &str| statuses.get(name).copied().unwrap_or(0) as i64;
            vec![
                SummaryItem::new("Total Bookings", total as i64),
                SummaryItem::new("Confirmed Bookings", status("confirmed")),
                SummaryItem::new("Pending Bookings", status("pending")),
                SummaryItem::new("Cancelled Bookings", status("cancelled")),
                SummaryItem::new("Completed Bookings", status("completed")),
                SummaryItem::new(
                    "Completion Rate",
                    rate(status("completed") as usize, total),
                ),
                SummaryItem::new(
                    "Average Students per Booking",
                    round1(average(table, "student_count")),
                ),
            ]
        }
        ReportType::ProgramPerformance => {
            let active = column_values(table, "is_active")
                .filter(|value| **value == Value::Bool(true))
                .count();
            vec![
                SummaryItem::new("Total Programs", total as i64),
                SummaryItem::new("Active Programs", active as i64),
                SummaryItem::new(
                    "Average Price per Student",
                    format_currency(average(table, "price_per_student")),
                ),
                SummaryItem::new(
                    "Average Duration (minutes)",
                    round1(average(table, "duration_minutes")),
                ),
                SummaryItem::new("Total Capacity", sum(table, "max_students") as i64),
            ]
        }
        ReportType::SchoolEngagement => {
            let active = column_values(table, "is_active")
                .filter(|value| **value == Value::Bool(true))
                .count();
            let districts: HashSet<String> = column_values(table, "district_name")
                .filter(|value| !value.is_null())
                .map(Value::display)
                .collect();
            vec![
                SummaryItem::new("Total Schools", total as i64),
                SummaryItem::new("Active Schools", active as i64),
                SummaryItem::new("Total Students", sum(table, "student_count") as i64),
                SummaryItem::new("Districts Represented", districts.len() as i64),
            ]
        }
        ReportType::FinancialSummary => {
            let payments = count_by(table, "payment_status");
            let payment = |name: &str| payments.get(name).copied().unwrap_or(0) as i64;
            let revenue = sum(table, "total_cost");
            let average_value = if total == 0 { 0.0 } else { revenue / total as f64 };
            vec![
                SummaryItem::new("Total Revenue", format_currency(revenue)),
                SummaryItem::new("Average Booking Value", format_currency(average_value)),
                SummaryItem::new("Paid Bookings", payment("paid")),
                SummaryItem::new("Pending Payments", payment("pending")),
                SummaryItem::new("Overdue Payments", payment("overdue")),
            ]
        }
        ReportType::PermissionSlipCompliance => {
            let signed = column_values(table, "is_signed")
                .filter(|value| **value == Value::Bool(true))
                .count();
            vec![
                SummaryItem::new("Total Permission Slips", total as i64),
                SummaryItem::new("Signed Slips", signed as i64),
                SummaryItem::new("Unsigned Slips", (total - signed) as i64),
                SummaryItem::new("Compliance Rate", rate(signed, total)),
                SummaryItem::new(
                    "Average Signing Time",
                    format!("{:.1} hours", average_signing_hours(table)),
                ),
                SummaryItem::new(
                    "Average Reminders Sent",
                    round1(average(table, "reminder_sent_count")),
                ),
            ]
        }
    }
}

fn average_signing_hours(table: &Table) -> f64 {
    let (Some(created), Some(signed)) = (
        table.column_index("created_at"),
        table.column_index("signed_at"),
    ) else {
        return 0.0;
    };
    let hours: Vec<f64> = table
        .rows
        .iter()
        .filter_map(|row| match (&row[created], &row[signed]) {
            (Value::DateTime(created), Value::DateTime(signed)) => {
                Some((*signed - *created).num_minutes() as f64 / 60.0)
            }
            _ => None,
        })
        .collect();
    if hours.is_empty() {
        0.0
    } else {
        hours.iter().sum::<f64>() / hours.len() as f64
    }
}
