use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

use super::filters::{check_school_district, read_inclusive_dates, read_shared, span_exceeds};
use super::{default_at, is_email, strip_empty, Fields};
use crate::aggregate::{AggregateFn, Aggregation, GroupBy};
use crate::artifact::ArtifactOptions;
use crate::delivery::{is_relative_storage_path, DeliveryTarget};
use crate::error::ValidationErrors;
use crate::filter::{
    range_age_error, DateRange, FilterSpecification, ValidationContext, EXPORT_MAX_SPAN_DAYS,
};
use crate::job::JobDefinition;
use crate::models::{DataType, ExportFormat};
use crate::render::RenderOptions;
use crate::source::columns;
use crate::table::SortDirection;

static FILENAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-\s]+$").expect("filename pattern compiles"));

const MAX_EXPORT_LIMIT: i64 = 50_000;

/// Strip empty values and fill the export defaults.
pub fn normalize_export(raw: &Value, ctx: &ValidationContext<'_>) -> Value {
    let mut input = strip_empty(raw);
    default_at(&mut input, "format", json!("csv"));
    default_at(&mut input, "include_headers", json!(true));
    default_at(&mut input, "include_totals", json!(false));
    default_at(&mut input, "sort_direction", json!("desc"));
    default_at(&mut input, "delivery_method", json!("download"));

    let data_type = input
        .get("data_type")
        .and_then(Value::as_str)
        .unwrap_or("export")
        .to_string();
    let stamp = ctx
        .now
        .with_timezone(&ctx.timezone)
        .format("%Y-%m-%d_%H-%M-%S");
    default_at(&mut input, "filename", json!(format!("{data_type}_export_{stamp}")));

    default_at(&mut input, "export_options.compress", json!(false));
    default_at(&mut input, "export_options.password_protect", json!(false));
    default_at(&mut input, "export_options.include_metadata", json!(true));
    input
}

pub fn parse_export(raw: &Value, ctx: &ValidationContext<'_>) -> Result<JobDefinition, ValidationErrors> {
    validate_export(&normalize_export(raw, ctx), ctx)
}

/// Validate a normalised export request into a job definition.
pub fn validate_export(input: &Value, ctx: &ValidationContext<'_>) -> Result<JobDefinition, ValidationErrors> {
    let mut fields = Fields::new(input);

    let data_type = match fields.string("data_type", "data type") {
        None if !fields.has("data_type") => {
            fields.fail("data_type", "Data type is required for export.");
            None
        }
        None => None,
        Some(value) => {
            let parsed = DataType::parse(&value);
            if parsed.is_none() {
                fields.fail("data_type", "Invalid data type selected for export.");
            }
            parsed
        }
    };

    let format = match fields.string("format", "export format") {
        None if !fields.has("format") => {
            fields.fail("format", "Export format is required.");
            None
        }
        None => None,
        Some(value) => {
            let parsed = ExportFormat::parse(&value);
            if parsed.is_none() {
                fields.fail("format", "Invalid export format selected.");
            }
            parsed
        }
    };

    let filename = fields
        .bounded_string("filename", "filename", 255, "Filename cannot exceed 255 characters.")
        .and_then(|name| {
            if FILENAME_PATTERN.is_match(&name) {
                Some(name)
            } else {
                fields.fail(
                    "filename",
                    "Filename can only contain letters, numbers, spaces, hyphens, and underscores.",
                );
                None
            }
        });

    let (start, end) = read_inclusive_dates(&mut fields, ctx.today());
    let shared = read_shared(&mut fields, ctx);

    let columns = fields.list("columns", "columns").and_then(|items| {
        if items.is_empty() {
            fields.fail("columns", "At least one column must be selected for export.");
            return None;
        }
        fields.string_list(
            "columns",
            "columns",
            |name| name.chars().count() <= 100,
            "Column name cannot exceed 100 characters.",
        )
    });

    let sort_by = fields.bounded_string(
        "sort_by",
        "sort field",
        100,
        "Sort field name cannot exceed 100 characters.",
    );
    let sort_direction = fields
        .string("sort_direction", "sort direction")
        .and_then(|value| {
            let parsed = SortDirection::parse(&value);
            if parsed.is_none() {
                fields.fail(
                    "sort_direction",
                    "Sort direction must be either ascending or descending.",
                );
            }
            parsed
        })
        .unwrap_or_default();

    let limit = fields.integer_in(
        "limit",
        "record limit",
        (1, "Export limit must be at least 1."),
        (MAX_EXPORT_LIMIT, "Export limit cannot exceed 50,000 records."),
    );

    let include_headers = fields.boolean("include_headers", "include headers").unwrap_or(true);
    let include_totals = fields.boolean("include_totals", "include totals").unwrap_or(false);

    let group_by = fields.string("group_by", "group by").and_then(|value| {
        let parsed = GroupBy::parse(&value);
        if parsed.is_none() {
            fields.fail("group_by", "Invalid grouping option selected.");
        }
        parsed
    });
    let functions = fields
        .string_list(
            "aggregate_functions",
            "aggregate functions",
            |value| AggregateFn::parse(value).is_some(),
            "Invalid aggregate function selected.",
        )
        .map(|names| names.iter().filter_map(|name| AggregateFn::parse(name)).collect())
        .unwrap_or_default();

    let compress = fields
        .boolean("export_options.compress", "compress")
        .unwrap_or(false);
    let password_protect = fields
        .boolean("export_options.password_protect", "password protect")
        .unwrap_or(false);
    let password = if password_protect {
        if fields.require(
            "export_options.password",
            "Password is required when password protection is enabled.",
        ) {
            fields.string("export_options.password", "password").and_then(|password| {
                let length = password.chars().count();
                if length < 8 {
                    fields.fail("export_options.password", "Password must be at least 8 characters.");
                    None
                } else if length > 50 {
                    fields.fail("export_options.password", "Password cannot exceed 50 characters.");
                    None
                } else {
                    Some(password)
                }
            })
        } else {
            None
        }
    } else {
        None
    };
    let include_metadata = fields
        .boolean("export_options.include_metadata", "include metadata")
        .unwrap_or(true);
    let watermark = fields.bounded_string(
        "export_options.watermark",
        "watermark",
        100,
        "Watermark text cannot exceed 100 characters.",
    );

    let delivery = read_delivery(&mut fields);

    if !fields.is_clean() {
        return Err(fields.finish());
    }
    let (Some(data_type), Some(format), Some(filename), Some(delivery)) =
        (data_type, format, filename, delivery)
    else {
        return Err(fields.finish());
    };

    // Cross-field rules.
    if let (Some(start), Some(end)) = (start, end) {
        if span_exceeds(start, end, EXPORT_MAX_SPAN_DAYS) {
            fields.fail("filters.end_date", "Date range cannot exceed 3 years for exports.");
        }
    }
    if let Some(message) =
        start.and_then(|start| range_age_error(start, ctx.today(), EXPORT_MAX_SPAN_DAYS))
    {
        fields.fail("filters.start_date", message);
    }
    check_school_district(&mut fields, ctx, &shared.scope);

    let requested = columns.unwrap_or_default();
    let invalid = columns::invalid_columns(data_type, &requested);
    if !invalid.is_empty() {
        fields.fail(
            "columns",
            format!("Invalid columns for {data_type} data type: {}", invalid.join(", ")),
        );
    }
    if let Some(sort_by) = &sort_by {
        let selectable = if requested.is_empty() {
            columns::valid_columns(data_type).contains(&sort_by.as_str())
        } else {
            requested.contains(sort_by)
        };
        if !selectable {
            fields.fail("sort_by", "Sort field must be one of the selected columns.");
        }
    }
    if let Some(limit) = limit {
        let max = format.max_rows();
        if limit as usize > max {
            fields.fail(
                "limit",
                format!("Maximum records allowed for {format} format is {max}."),
            );
        }
    }
    if let Some(group_by) = group_by {
        if group_by.source_column(data_type).is_none() {
            fields.fail(
                "group_by",
                format!("{data_type} data cannot be grouped by {}.", group_label(group_by)),
            );
        }
    }
    if !fields.is_clean() {
        return Err(fields.finish());
    }

    let date_range = if start.is_none() && end.is_none() {
        DateRange::All
    } else {
        DateRange::Fixed { start, end }
    };
    let mut filter = FilterSpecification::new(data_type, date_range, EXPORT_MAX_SPAN_DAYS);
    filter.scope = shared.scope;
    filter.status = shared.status;
    filter.bounds = shared.bounds;
    filter.columns = requested;

    Ok(JobDefinition {
        report_type: None,
        title: export_title(data_type),
        description: None,
        format,
        filter,
        aggregation: group_by.map(|group_by| Aggregation::new(group_by, functions)),
        sort_by,
        sort_direction,
        limit: limit.map(|limit| limit as usize),
        render: RenderOptions {
            include_headers,
            include_totals,
            watermark,
            include_metadata,
        },
        artifact: ArtifactOptions { compress, password },
        delivery,
        filename,
        include_charts: false,
        include_raw_data: true,
    })
}

fn read_delivery(fields: &mut Fields<'_>) -> Option<DeliveryTarget> {
    let method = fields.string("delivery_method", "delivery method")?;
    match method.as_str() {
        "download" => Some(DeliveryTarget::Download),
        "email" => {
            if !fields.require("delivery_email", "Email address is required for email delivery.") {
                return None;
            }
            let email = fields.string("delivery_email", "delivery email")?;
            if email.len() > 255 || !is_email(&email) {
                fields.fail("delivery_email", "Please provide a valid email address.");
                return None;
            }
            Some(DeliveryTarget::Email {
                recipients: vec![email],
                subject: None,
                message: None,
                attach: true,
                compress: false,
            })
        }
        "storage" => {
            if !fields.require("storage_path", "Storage path is required for storage delivery.") {
                return None;
            }
            let path = fields.bounded_string(
                "storage_path",
                "storage path",
                500,
                "Storage path cannot exceed 500 characters.",
            )?;
            if !is_relative_storage_path(&path) {
                fields.fail(
                    "storage_path",
                    "Storage path must be relative and cannot leave the storage directory.",
                );
                return None;
            }
            Some(DeliveryTarget::Storage { path })
        }
        _ => {
            fields.fail("delivery_method", "Invalid delivery method selected.");
            None
        }
    }
}

fn group_label(group_by: GroupBy) -> &'static str {
    match group_by {
        GroupBy::Day => "day",
        GroupBy::Week => "week",
        GroupBy::Month => "month",
        GroupBy::Quarter => "quarter",
        GroupBy::Year => "year",
        GroupBy::School => "school",
        GroupBy::Program => "program",
        GroupBy::Teacher => "teacher",
    }
}

/// `permission_slips` -> `Permission Slips Export`.
fn export_title(data_type: DataType) -> String {
    let words: Vec<String> = data_type
        .as_str()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    format!("{} Export", words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::StaticCatalog;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use chrono_tz::Tz;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 9, 30, 0).unwrap()
    }

    fn parse(raw: Value) -> Result<JobDefinition, ValidationErrors> {
        let catalog = StaticCatalog::new().with_school(10, Some(1));
        let ctx = ValidationContext::new(now(), Tz::UTC, &catalog);
        parse_export(&raw, &ctx)
    }

    #[test]
    fn minimal_request_gets_defaults() {
        let definition = parse(json!({
            "data_type": "bookings",
            "filters": {"start_date": "2024-01-01", "end_date": "2024-01-31"}
        }))
        .unwrap();
        assert_eq!(definition.format, ExportFormat::Csv);
        assert_eq!(definition.filename, "bookings_export_2024-02-01_09-30-00");
        assert_eq!(definition.title, "Bookings Export");
        assert_eq!(definition.sort_direction, SortDirection::Desc);
        assert!(definition.render.include_headers);
        assert!(!definition.render.include_totals);
        assert!(definition.render.include_metadata);
        assert_eq!(definition.delivery, DeliveryTarget::Download);
        assert_eq!(
            definition.filter.date_range,
            DateRange::Fixed {
                start: NaiveDate::from_ymd_opt(2024, 1, 1),
                end: NaiveDate::from_ymd_opt(2024, 1, 31),
            }
        );
    }

    #[test]
    fn unknown_columns_are_listed() {
        let errors = parse(json!({"data_type": "bookings", "columns": ["bogus_column"]}))
            .unwrap_err();
        assert_eq!(
            errors.messages("columns"),
            ["Invalid columns for bookings data type: bogus_column"]
        );
    }

    #[test]
    fn cross_field_rules_wait_for_clean_fields() {
        let errors = parse(json!({
            "data_type": "bookings",
            "format": "pdf",
            "limit": 2000,
            "columns": ["bogus_column"],
            "sort_direction": "sideways"
        }))
        .unwrap_err();
        assert!(errors.has("sort_direction"));
        assert!(!errors.has("columns"));
        assert!(!errors.has("limit"));
    }

    #[test]
    fn limit_is_capped_by_format() {
        let errors = parse(json!({"data_type": "financial", "format": "pdf", "limit": 20000}))
            .unwrap_err();
        assert_eq!(
            errors.messages("limit"),
            ["Maximum records allowed for pdf format is 1000."]
        );
        assert!(parse(json!({"data_type": "financial", "format": "csv", "limit": 20000})).is_ok());
    }

    #[test]
    fn sort_field_must_be_selected() {
        let errors = parse(json!({
            "data_type": "bookings",
            "columns": ["id", "status"],
            "sort_by": "total_cost"
        }))
        .unwrap_err();
        assert_eq!(
            errors.messages("sort_by"),
            ["Sort field must be one of the selected columns."]
        );
    }

    #[test]
    fn storage_paths_stay_below_the_root() {
        for path in ["../outside", "district/../../etc", "/var/exports"] {
            let errors = parse(json!({
                "data_type": "users",
                "delivery_method": "storage",
                "storage_path": path
            }))
            .unwrap_err();
            assert_eq!(
                errors.messages("storage_path"),
                ["Storage path must be relative and cannot leave the storage directory."],
                "{path}"
            );
        }
    }

    #[test]
    fn ranges_starting_too_long_ago_are_rejected() {
        let errors = parse(json!({
            "data_type": "bookings",
            "filters": {"start_date": "2020-01-01", "end_date": "2020-06-30"}
        }))
        .unwrap_err();
        assert_eq!(
            errors.messages("filters.start_date"),
            ["Date range starts more than 1095 days before today."]
        );
        assert!(parse(json!({
            "data_type": "bookings",
            "filters": {"start_date": "2021-03-01", "end_date": "2021-06-30"}
        }))
        .is_ok());
    }

    #[test]
    fn delivery_targets_need_their_address() {
        let errors = parse(json!({"data_type": "users", "delivery_method": "email"})).unwrap_err();
        assert_eq!(
            errors.messages("delivery_email"),
            ["Email address is required for email delivery."]
        );
        let errors = parse(json!({"data_type": "users", "delivery_method": "storage"})).unwrap_err();
        assert!(errors.has("storage_path"));
        let definition = parse(json!({
            "data_type": "users",
            "delivery_method": "storage",
            "storage_path": "district/exports"
        }))
        .unwrap();
        assert_eq!(
            definition.delivery,
            DeliveryTarget::Storage {
                path: "district/exports".to_string()
            }
        );
    }

    #[test]
    fn password_protection_requires_a_password() {
        let errors = parse(json!({
            "data_type": "bookings",
            "export_options": {"password_protect": true}
        }))
        .unwrap_err();
        assert!(errors.has("export_options.password"));
        let definition = parse(json!({
            "data_type": "bookings",
            "export_options": {"password_protect": true, "password": "correct horse", "compress": true}
        }))
        .unwrap();
        assert_eq!(definition.artifact.password.as_deref(), Some("correct horse"));
        assert!(definition.artifact.compress);
    }

    #[test]
    fn export_ranges_stop_at_three_years() {
        let errors = parse(json!({
            "data_type": "bookings",
            "filters": {"start_date": "2020-01-01", "end_date": "2024-01-01"}
        }))
        .unwrap_err();
        assert_eq!(
            errors.messages("filters.end_date"),
            ["Date range cannot exceed 3 years for exports."]
        );
    }

    #[test]
    fn grouping_must_fit_the_data_type() {
        let errors = parse(json!({"data_type": "schools", "group_by": "teacher"})).unwrap_err();
        assert!(errors.has("group_by"));
        let definition = parse(json!({
            "data_type": "bookings",
            "group_by": "month",
            "aggregate_functions": ["sum", "avg"]
        }))
        .unwrap();
        let aggregation = definition.aggregation.unwrap();
        assert_eq!(aggregation.group_by, GroupBy::Month);
        assert_eq!(aggregation.functions, vec![AggregateFn::Sum, AggregateFn::Avg]);
    }

    #[test]
    fn bad_filenames_are_rejected() {
        let errors = parse(json!({"data_type": "bookings", "filename": "../etc/passwd"})).unwrap_err();
        assert!(errors.has("filename"));
    }
}
