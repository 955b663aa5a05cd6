//! Column allowlists per data type.

use crate::models::DataType;

const BOOKINGS: &[&str] = &[
    "id",
    "booking_reference",
    "school_name",
    "program_title",
    "teacher_name",
    "status",
    "student_count",
    "total_cost",
    "confirmed_date",
    "created_at",
];

const PROGRAMS: &[&str] = &[
    "id",
    "title",
    "description",
    "grade_levels",
    "duration_minutes",
    "max_students",
    "price_per_student",
    "is_active",
    "created_at",
];

const SCHOOLS: &[&str] = &[
    "id",
    "name",
    "district_name",
    "type",
    "city",
    "state",
    "student_count",
    "is_active",
    "created_at",
];

const FINANCIAL: &[&str] = &[
    "booking_id",
    "school_name",
    "program_title",
    "total_cost",
    "payment_status",
    "payment_due_date",
    "confirmed_date",
];

const PERMISSION_SLIPS: &[&str] = &[
    "id",
    "booking_reference",
    "student_name",
    "parent_name",
    "parent_email",
    "is_signed",
    "signed_at",
    "reminder_sent_count",
    "created_at",
];

const USERS: &[&str] = &[
    "id",
    "name",
    "email",
    "role",
    "school_name",
    "is_active",
    "created_at",
];

const ANALYTICS_SUMMARY: &[&str] = &["metric", "value"];

/// Columns a caller may request for `data_type`.
pub fn valid_columns(data_type: DataType) -> &'static [&'static str] {
    match data_type {
        DataType::Bookings => BOOKINGS,
        DataType::Programs => PROGRAMS,
        DataType::Schools => SCHOOLS,
        DataType::Financial => FINANCIAL,
        DataType::PermissionSlips => PERMISSION_SLIPS,
        DataType::Users => USERS,
        DataType::AnalyticsSummary => ANALYTICS_SUMMARY,
    }
}

/// Output columns when the caller names none.
pub fn default_columns(data_type: DataType) -> &'static [&'static str] {
    valid_columns(data_type)
}

/// Requested columns outside the allowlist, in request order.
pub fn invalid_columns(data_type: DataType, requested: &[String]) -> Vec<String> {
    let valid = valid_columns(data_type);
    requested
        .iter()
        .filter(|column| !valid.contains(&column.as_str()))
        .cloned()
        .collect()
}

/// Column temporal grouping truncates.
pub fn date_column(data_type: DataType) -> Option<&'static str> {
    match data_type {
        DataType::Financial => Some("confirmed_date"),
        DataType::AnalyticsSummary => None,
        _ => Some("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_columns_are_reported_in_order() {
        let requested = vec![
            "id".to_string(),
            "bogus_column".to_string(),
            "status".to_string(),
            "parent_email".to_string(),
        ];
        assert_eq!(
            invalid_columns(DataType::Bookings, &requested),
            vec!["bogus_column", "parent_email"]
        );
    }

    #[test]
    fn financial_groups_on_confirmation_date() {
        assert_eq!(date_column(DataType::Financial), Some("confirmed_date"));
        assert_eq!(date_column(DataType::Bookings), Some("created_at"));
        assert_eq!(date_column(DataType::AnalyticsSummary), None);
    }
}
