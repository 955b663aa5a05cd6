//! Filter rules shared by every request kind.

use chrono::NaiveDate;

use super::Fields;
use crate::filter::{
    NumericBounds, ScopeFilters, StatusFilters, ValidationContext, BOOKING_STATUSES,
    GRADE_LEVELS, PAYMENT_STATUSES,
};

pub(crate) struct SharedFilters {
    pub scope: ScopeFilters,
    pub status: StatusFilters,
    pub bounds: NumericBounds,
}

/// Scope ids, status sets, grade levels and numeric bounds under `filters.`.
pub(crate) fn read_shared(fields: &mut Fields<'_>, ctx: &ValidationContext<'_>) -> SharedFilters {
    let catalog = ctx.catalog;
    let mut scope = ScopeFilters::default();

    scope.school_id = existing(fields, "filters.school_id", "school", |id| catalog.school_exists(id));
    scope.district_id = existing(fields, "filters.district_id", "district", |id| {
        catalog.district_exists(id)
    });
    scope.program_id = existing(fields, "filters.program_id", "program", |id| {
        catalog.program_exists(id)
    });
    scope.teacher_id = existing(fields, "filters.teacher_id", "teacher", |id| {
        catalog.teacher_exists(id)
    });

    let status = StatusFilters {
        booking_status: fields
            .string_list(
                "filters.status",
                "booking status",
                |value| BOOKING_STATUSES.contains(&value),
                "Invalid status selected.",
            )
            .unwrap_or_default(),
        payment_status: fields
            .string_list(
                "filters.payment_status",
                "payment status",
                |value| PAYMENT_STATUSES.contains(&value),
                "Invalid payment status selected.",
            )
            .unwrap_or_default(),
        grade_levels: fields
            .string_list(
                "filters.grade_levels",
                "grade levels",
                |value| GRADE_LEVELS.contains(&value),
                "Invalid grade level selected.",
            )
            .unwrap_or_default(),
        include_cancelled: fields.boolean("filters.include_cancelled", "include cancelled"),
        include_deleted: fields
            .boolean("filters.include_deleted", "include deleted")
            .unwrap_or(false),
    };

    let min_students = fields.integer_in(
        "filters.min_students",
        "minimum students",
        (1, "Minimum students must be at least 1."),
        (100, "Minimum students cannot exceed 100."),
    );
    let max_students = fields.integer_in(
        "filters.max_students",
        "maximum students",
        (1, "Maximum students must be at least 1."),
        (100, "Maximum students cannot exceed 100."),
    );
    if let (Some(min), Some(max)) = (min_students, max_students) {
        if max < min {
            fields.fail(
                "filters.max_students",
                "Maximum students must be greater than or equal to minimum students.",
            );
        }
    }

    let min_revenue = non_negative(fields, "filters.min_revenue", "minimum revenue", "Minimum revenue must be at least 0.");
    let max_revenue = non_negative(fields, "filters.max_revenue", "maximum revenue", "Maximum revenue must be at least 0.");
    if let (Some(min), Some(max)) = (min_revenue, max_revenue) {
        if max < min {
            fields.fail(
                "filters.max_revenue",
                "Maximum revenue must be greater than or equal to minimum revenue.",
            );
        }
    }

    SharedFilters {
        scope,
        status,
        bounds: NumericBounds {
            min_students,
            max_students,
            min_revenue,
            max_revenue,
        },
    }
}

fn existing(
    fields: &mut Fields<'_>,
    path: &str,
    label: &str,
    exists: impl Fn(i64) -> bool,
) -> Option<i64> {
    let id = fields.integer(path, label)?;
    if !exists(id) {
        fields.fail(path, format!("Selected {label} does not exist."));
        return None;
    }
    Some(id)
}

fn non_negative(fields: &mut Fields<'_>, path: &str, label: &str, message: &str) -> Option<f64> {
    let value = fields.number(path, label)?;
    if value < 0.0 {
        fields.fail(path, message);
        return None;
    }
    Some(value)
}

/// A school named together with a district must belong to it.
pub(crate) fn check_school_district(
    fields: &mut Fields<'_>,
    ctx: &ValidationContext<'_>,
    scope: &ScopeFilters,
) {
    if let (Some(school_id), Some(district_id)) = (scope.school_id, scope.district_id) {
        if ctx.catalog.school_district(school_id) != Some(district_id) {
            fields.fail(
                "filters.school_id",
                "Selected school does not belong to the selected district.",
            );
        }
    }
}

/// Inclusive `start_date`/`end_date` pair. An inverted pair reports on both fields.
pub(crate) fn read_inclusive_dates(
    fields: &mut Fields<'_>,
    today: NaiveDate,
) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let start = fields.date("filters.start_date", "start date");
    let end = fields.date("filters.end_date", "end date");
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            fields.fail("filters.start_date", "Start date must be before or equal to end date.");
            fields.fail("filters.end_date", "End date must be after or equal to start date.");
        }
    }
    if end.is_some_and(|end| end > today) {
        fields.fail("filters.end_date", "End date cannot be in the future.");
    }
    (start, end)
}

/// Days between two dates exceed `max_days`.
pub(crate) fn span_exceeds(start: NaiveDate, end: NaiveDate, max_days: i64) -> bool {
    (end - start).num_days().abs() > max_days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::StaticCatalog;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Tz;
    use serde_json::json;

    fn catalog() -> StaticCatalog {
        StaticCatalog::new()
            .with_school(10, Some(1))
            .with_school(11, Some(2))
            .with_program(5)
            .with_teacher(9)
    }

    #[test]
    fn unknown_references_and_bad_enumerations_are_reported() {
        let catalog = catalog();
        let ctx = ValidationContext::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            Tz::UTC,
            &catalog,
        );
        let input = json!({"filters": {
            "school_id": 99,
            "program_id": 5,
            "status": ["confirmed", "lost"],
            "grade_levels": ["K", "13"],
            "min_students": 30,
            "max_students": 10,
        }});
        let mut fields = Fields::new(&input);
        let shared = read_shared(&mut fields, &ctx);
        assert_eq!(shared.scope.program_id, Some(5));
        let errors = fields.finish();
        assert_eq!(errors.messages("filters.school_id"), ["Selected school does not exist."]);
        assert_eq!(errors.messages("filters.status.1"), ["Invalid status selected."]);
        assert_eq!(errors.messages("filters.grade_levels.1"), ["Invalid grade level selected."]);
        assert!(errors.has("filters.max_students"));
    }

    #[test]
    fn school_must_sit_in_the_named_district() {
        let catalog = catalog();
        let ctx = ValidationContext::new(Utc::now(), Tz::UTC, &catalog);
        let input = json!({});
        let mut fields = Fields::new(&input);
        let scope = ScopeFilters {
            school_id: Some(11),
            district_id: Some(1),
            ..ScopeFilters::default()
        };
        check_school_district(&mut fields, &ctx, &scope);
        assert!(fields.finish().has("filters.school_id"));
    }

    #[test]
    fn inverted_dates_report_on_both_fields() {
        let input = json!({"filters": {"start_date": "2024-02-01", "end_date": "2024-01-01"}});
        let mut fields = Fields::new(&input);
        read_inclusive_dates(&mut fields, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let errors = fields.finish();
        assert_eq!(
            errors.messages("filters.start_date"),
            ["Start date must be before or equal to end date."]
        );
        assert_eq!(
            errors.messages("filters.end_date"),
            ["End date must be after or equal to start date."]
        );
    }
}
