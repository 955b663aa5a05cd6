use chrono::Months;
use chrono_tz::Tz;
use serde_json::{json, Value};

use super::filters::{check_school_district, read_shared, span_exceeds};
use super::generate::{read_title, report_format};
use super::{default_at, has_duplicates, slug, strip_empty, Fields};
use crate::artifact::ArtifactOptions;
use crate::delivery::DeliveryTarget;
use crate::error::ValidationErrors;
use crate::filter::{
    range_age_error, DateRange, FilterSpecification, RelativePeriod, ValidationContext,
    REPORT_MAX_SPAN_DAYS,
};
use crate::job::JobDefinition;
use crate::models::ReportType;
use crate::render::RenderOptions;
use crate::schedule::{Frequency, ScheduleDefinition};
use crate::table::SortDirection;

type Range = ((i64, &'static str), (i64, &'static str));

pub(super) const DAY_OF_WEEK_RANGE: Range = (
    (0, "Day of week must be between 0 (Sunday) and 6 (Saturday)."),
    (6, "Day of week must be between 0 (Sunday) and 6 (Saturday)."),
);
pub(super) const DAY_OF_MONTH_RANGE: Range = (
    (1, "Day of month must be between 1 and 31."),
    (31, "Day of month must be between 1 and 31."),
);
const MONTH_OF_YEAR_RANGE: Range = (
    (1, "Month must be between 1 (January) and 12 (December)."),
    (12, "Month must be between 1 (January) and 12 (December)."),
);

const RELATIVE_PERIODS: [&str; 6] = [
    "last_week",
    "last_month",
    "last_quarter",
    "last_year",
    "month_to_date",
    "year_to_date",
];

const MAX_RECIPIENTS: usize = 20;
const MAX_SCHEDULE_YEARS: u32 = 5;

/// A validated recurring schedule: the job each run creates plus the recurrence rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub title: String,
    pub template: JobDefinition,
    pub definition: ScheduleDefinition,
}

pub fn normalize_schedule(raw: &Value, ctx: &ValidationContext<'_>) -> Value {
    let mut input = strip_empty(raw);
    default_at(&mut input, "format", json!("pdf"));
    default_at(&mut input, "timezone", json!(ctx.timezone.name()));
    default_at(&mut input, "is_active", json!(true));
    default_at(&mut input, "retry_on_failure", json!(true));
    let retrying = match input.get("retry_on_failure") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text == "true" || text == "1",
        Some(Value::Number(number)) => number.as_i64() == Some(1),
        _ => false,
    };
    if retrying {
        default_at(&mut input, "max_retries", json!(3));
    }

    let title = input
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Analytics Report")
        .to_string();
    default_at(
        &mut input,
        "delivery_options.email_subject",
        json!(format!("Scheduled Report: {title}")),
    );
    default_at(&mut input, "delivery_options.attach_raw_data", json!(false));
    default_at(&mut input, "delivery_options.compress_files", json!(true));

    if let Some(map) = input.as_object_mut() {
        if map
            .get("failure_notification_emails")
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty)
        {
            map.remove("failure_notification_emails");
        }
    }
    input
}

/// `template` is the stored job named by `report_template_id`, when the caller resolved one.
pub fn parse_schedule(
    raw: &Value,
    ctx: &ValidationContext<'_>,
    template: Option<&JobDefinition>,
) -> Result<ScheduleRequest, ValidationErrors> {
    validate_schedule(&normalize_schedule(raw, ctx), ctx, template)
}

pub fn validate_schedule(
    input: &Value,
    ctx: &ValidationContext<'_>,
    template: Option<&JobDefinition>,
) -> Result<ScheduleRequest, ValidationErrors> {
    let mut fields = Fields::new(input);
    let today = ctx.today();

    let uses_template = fields.has("report_template_id");
    if uses_template && template.is_none() {
        fields.fail("report_template_id", "Selected report template does not exist.");
    }
    let report_type = if uses_template {
        None
    } else if fields.require("report_type", "Report type is required when not using a template.") {
        fields.string("report_type", "report type").and_then(|value| {
            let parsed = ReportType::parse(&value);
            if parsed.is_none() {
                fields.fail("report_type", "Invalid report type selected.");
            }
            parsed
        })
    } else {
        None
    };

    let title = read_title(&mut fields, "Schedule");
    let description = fields.bounded_string(
        "description",
        "description",
        1000,
        "Description cannot exceed 1000 characters.",
    );

    let frequency = if fields.require("frequency", "Schedule frequency is required.") {
        fields.string("frequency", "frequency").and_then(|value| {
            let parsed = Frequency::parse(&value);
            if parsed.is_none() {
                fields.fail("frequency", "Invalid frequency selected.");
            }
            parsed
        })
    } else {
        None
    };
    match frequency {
        Some(Frequency::Weekly) => {
            fields.require("day_of_week", "Day of week is required for weekly schedules.");
        }
        Some(Frequency::Monthly) => {
            fields.require("day_of_month", "Day of month is required for monthly schedules.");
        }
        Some(Frequency::Yearly) => {
            fields.require("month_of_year", "Month of year is required for yearly schedules.");
        }
        _ => {}
    }
    let day_of_week = fields.integer_in("day_of_week", "day of week", DAY_OF_WEEK_RANGE.0, DAY_OF_WEEK_RANGE.1);
    let day_of_month =
        fields.integer_in("day_of_month", "day of month", DAY_OF_MONTH_RANGE.0, DAY_OF_MONTH_RANGE.1);
    let month_of_year = fields.integer_in(
        "month_of_year",
        "month of year",
        MONTH_OF_YEAR_RANGE.0,
        MONTH_OF_YEAR_RANGE.1,
    );

    let time = if fields.require("time", "Schedule time is required.") {
        fields.time("time", "time", "Time must be in HH:MM format (24-hour).")
    } else {
        None
    };
    let timezone = if fields.require("timezone", "Timezone is required.") {
        fields.string("timezone", "timezone").and_then(|name| match name.parse::<Tz>() {
            Ok(timezone) => Some(timezone),
            Err(_) => {
                fields.fail("timezone", "Invalid timezone specified.");
                None
            }
        })
    } else {
        None
    };
    let format = report_format(&mut fields);

    let recipients = read_recipients(&mut fields, "recipients");

    let mut date_range = None;
    let mut fixed_dates = (None, None);
    if fields.require("filters", "Report filters are required.")
        && fields.require("filters.date_range_type", "Date range type is required.")
    {
        match fields.string("filters.date_range_type", "date range type").as_deref() {
            Some("relative") => {
                if fields.require(
                    "filters.relative_period",
                    "Relative period is required for relative date ranges.",
                ) {
                    let period = fields
                        .string("filters.relative_period", "relative period")
                        .filter(|value| RELATIVE_PERIODS.contains(&value.as_str()))
                        .and_then(|value| RelativePeriod::parse(&value));
                    match period {
                        Some(period) => date_range = Some(DateRange::Relative { period }),
                        None if !fields.failed("filters.relative_period") => {
                            fields.fail("filters.relative_period", "Invalid relative period selected.")
                        }
                        None => {}
                    }
                }
            }
            Some("fixed") => {
                fields.require(
                    "filters.fixed_start_date",
                    "Start date is required for fixed date ranges.",
                );
                fields.require(
                    "filters.fixed_end_date",
                    "End date is required for fixed date ranges.",
                );
                let start = fields.date("filters.fixed_start_date", "start date");
                let end = fields.date("filters.fixed_end_date", "end date");
                if let (Some(start), Some(end)) = (start, end) {
                    if start >= end {
                        fields.fail("filters.fixed_start_date", "Start date must be before end date.");
                        fields.fail("filters.fixed_end_date", "End date must be after start date.");
                    } else {
                        date_range = Some(DateRange::Fixed {
                            start: Some(start),
                            end: Some(end),
                        });
                        fixed_dates = (Some(start), Some(end));
                    }
                }
            }
            Some(_) => fields.fail("filters.date_range_type", "Invalid date range type selected."),
            None => {}
        }
    }
    let shared = read_shared(&mut fields, ctx);

    let email_subject = fields.bounded_string(
        "delivery_options.email_subject",
        "email subject",
        255,
        "Email subject cannot exceed 255 characters.",
    );
    let email_message = fields.bounded_string(
        "delivery_options.email_message",
        "email message",
        2000,
        "Email message cannot exceed 2000 characters.",
    );
    let attach_raw_data = fields
        .boolean("delivery_options.attach_raw_data", "attach raw data")
        .unwrap_or(false);
    let compress_files = fields
        .boolean("delivery_options.compress_files", "compress files")
        .unwrap_or(true);

    let is_active = fields.boolean("is_active", "is active").unwrap_or(true);
    let start_date = fields.date("start_date", "schedule start date");
    if start_date.is_some_and(|start| start < today) {
        fields.fail("start_date", "Schedule start date cannot be in the past.");
    }
    let end_date = fields.date("end_date", "schedule end date");
    if let Some(end) = end_date {
        if end <= start_date.unwrap_or(today) {
            fields.fail("end_date", "Schedule end date must be after start date.");
        }
    }
    let max_executions = fields.integer_in(
        "max_executions",
        "maximum executions",
        (1, "Maximum executions must be at least 1."),
        (1000, "Maximum executions cannot exceed 1000."),
    );
    let retry_on_failure = fields
        .boolean("retry_on_failure", "retry on failure")
        .unwrap_or(true);
    let max_retries = if retry_on_failure {
        if fields.require(
            "max_retries",
            "Maximum retries is required when retry on failure is enabled.",
        ) {
            fields.integer_in(
                "max_retries",
                "maximum retries",
                (1, "Maximum retries must be at least 1."),
                (5, "Maximum retries cannot exceed 5."),
            )
        } else {
            None
        }
    } else {
        Some(0)
    };
    let failure_emails = if fields.has("failure_notification_emails") {
        fields.emails(
            "failure_notification_emails",
            "failure notification emails",
            "All failure notification emails must be valid.",
        )
    } else {
        Some(Vec::new())
    };

    if !fields.is_clean() {
        return Err(fields.finish());
    }
    let (
        Some(title),
        Some(frequency),
        Some(time),
        Some(timezone),
        Some(format),
        Some(recipients),
        Some(date_range),
        Some(max_retries),
        Some(failure_emails),
    ) = (
        title,
        frequency,
        time,
        timezone,
        format,
        recipients,
        date_range,
        max_retries,
        failure_emails,
    )
    else {
        return Err(fields.finish());
    };

    let definition = ScheduleDefinition {
        frequency,
        day_of_week: day_of_week.map(|day| day as u32),
        day_of_month: day_of_month.map(|day| day as u32),
        month_of_year: month_of_year.map(|month| month as u32),
        time,
        timezone,
        recipients,
        is_active,
        start_date,
        end_date,
        max_executions: max_executions.map(|max| max as u32),
        retry_on_failure,
        max_retries: max_retries as u32,
        failure_notification_emails: failure_emails,
    };

    // Cross-field rules.
    check_day_of_month(&mut fields, "day_of_month", &definition);
    check_school_district(&mut fields, ctx, &shared.scope);
    if let (Some(start), Some(end)) = fixed_dates {
        if span_exceeds(start, end, REPORT_MAX_SPAN_DAYS) {
            fields.fail("filters.fixed_end_date", "Fixed date range cannot exceed 2 years.");
        }
        if let Some(message) = range_age_error(start, today, REPORT_MAX_SPAN_DAYS) {
            fields.fail("filters.fixed_start_date", message);
        }
    }
    if let Some(end) = end_date {
        let start = start_date.unwrap_or(today);
        let limit = start.checked_add_months(Months::new(12 * MAX_SCHEDULE_YEARS));
        if limit.is_some_and(|limit| end > limit) {
            fields.fail("end_date", "Schedule duration cannot exceed 5 years.");
        }
    }
    if has_duplicates(&definition.failure_notification_emails) {
        fields.fail(
            "failure_notification_emails",
            "Failure notification emails must be unique.",
        );
    }
    if !fields.is_clean() {
        return Err(fields.finish());
    }

    let delivery = DeliveryTarget::Email {
        recipients: definition.recipients.clone(),
        subject: email_subject,
        message: email_message,
        attach: attach_raw_data,
        compress: compress_files,
    };
    let template = match template {
        Some(stored) => {
            let mut filter = FilterSpecification::new(
                stored.filter.data_type,
                date_range,
                REPORT_MAX_SPAN_DAYS,
            );
            filter.scope = shared.scope;
            filter.status = shared.status;
            filter.bounds = shared.bounds;
            filter.columns = stored.filter.columns.clone();
            JobDefinition {
                title: title.clone(),
                description: description.or_else(|| stored.description.clone()),
                format,
                filter,
                delivery,
                artifact: ArtifactOptions::default(),
                ..stored.clone()
            }
        }
        None => {
            let Some(report_type) = report_type else {
                return Err(fields.finish());
            };
            let mut filter =
                FilterSpecification::new(report_type.data_type(), date_range, REPORT_MAX_SPAN_DAYS);
            filter.scope = shared.scope;
            filter.status = shared.status;
            filter.bounds = shared.bounds;
            JobDefinition {
                report_type: Some(report_type),
                title: title.clone(),
                description,
                format,
                filter,
                aggregation: None,
                sort_by: None,
                sort_direction: SortDirection::Desc,
                limit: None,
                render: RenderOptions::default(),
                artifact: ArtifactOptions::default(),
                delivery,
                filename: slug(&title),
                include_charts: true,
                include_raw_data: false,
            }
        }
    };

    Ok(ScheduleRequest {
        title,
        template,
        definition,
    })
}

/// Anchor days above 28 do not exist in every month.
pub(super) fn check_day_of_month(fields: &mut Fields<'_>, path: &str, definition: &ScheduleDefinition) {
    let anchored = matches!(
        definition.frequency,
        Frequency::Monthly | Frequency::Quarterly | Frequency::Yearly
    );
    if anchored && definition.day_of_month.is_some_and(|day| day > 28) {
        fields.fail(
            path,
            "Day of month should not exceed 28 to ensure it exists in all months.",
        );
    }
}

/// Required, non-empty, at most 20 valid and distinct addresses.
pub(super) fn read_recipients(fields: &mut Fields<'_>, path: &str) -> Option<Vec<String>> {
    if !fields.require(path, "At least one recipient email is required.") {
        return None;
    }
    let recipients = match fields.list(path, "recipients") {
        Some([]) => {
            fields.fail(path, "At least one recipient email is required.");
            None
        }
        Some(items) if items.len() > MAX_RECIPIENTS => {
            fields.fail(path, "Maximum of 20 recipients allowed.");
            None
        }
        Some(_) => fields.emails(path, "recipients", "All recipients must be valid email addresses."),
        None => None,
    }?;
    if has_duplicates(&recipients) {
        fields.fail(path, "Recipient emails must be unique.");
        return None;
    }
    Some(recipients)
}

/// Email delivery with the defaults a schedule gets when it sets no delivery options.
pub(super) fn default_email_delivery(title: &str, recipients: &[String]) -> DeliveryTarget {
    DeliveryTarget::Email {
        recipients: recipients.to_vec(),
        subject: Some(format!("Scheduled Report: {title}")),
        message: None,
        attach: false,
        compress: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::StaticCatalog;
    use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn request() -> Value {
        json!({
            "report_type": "booking_summary",
            "title": "Monthly Bookings",
            "frequency": "monthly",
            "day_of_month": 15,
            "time": "07:30",
            "recipients": ["admin@district.org", "ops@district.org"],
            "filters": {"date_range_type": "relative", "relative_period": "last_month"}
        })
    }

    fn parse(raw: Value) -> Result<ScheduleRequest, ValidationErrors> {
        let catalog = StaticCatalog::new();
        let ctx = ValidationContext::new(now(), Tz::UTC, &catalog);
        parse_schedule(&raw, &ctx, None)
    }

    fn with(mut raw: Value, key: &str, value: Value) -> Value {
        raw[key] = value;
        raw
    }

    #[test]
    fn defaults_fill_policy_and_delivery() {
        let parsed = parse(request()).unwrap();
        let definition = &parsed.definition;
        assert_eq!(definition.frequency, Frequency::Monthly);
        assert_eq!(definition.time, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert_eq!(definition.timezone, Tz::UTC);
        assert!(definition.is_active);
        assert!(definition.retry_on_failure);
        assert_eq!(definition.max_retries, 3);
        assert_eq!(parsed.template.format, crate::models::ExportFormat::Pdf);
        assert_eq!(
            parsed.template.delivery,
            DeliveryTarget::Email {
                recipients: vec!["admin@district.org".to_string(), "ops@district.org".to_string()],
                subject: Some("Scheduled Report: Monthly Bookings".to_string()),
                message: None,
                attach: false,
                compress: true,
            }
        );
    }

    #[test]
    fn day_31_is_rejected_for_monthly_schedules() {
        let errors = parse(with(request(), "day_of_month", json!(31))).unwrap_err();
        assert_eq!(
            errors.messages("day_of_month"),
            ["Day of month should not exceed 28 to ensure it exists in all months."]
        );
        let errors = parse(with(request(), "day_of_month", json!(32))).unwrap_err();
        assert_eq!(errors.messages("day_of_month"), ["Day of month must be between 1 and 31."]);
    }

    #[test]
    fn frequency_specific_fields_are_required() {
        let weekly = with(request(), "frequency", json!("weekly"));
        assert!(parse(weekly).unwrap_err().has("day_of_week"));
        let yearly = with(request(), "frequency", json!("yearly"));
        assert_eq!(
            parse(yearly).unwrap_err().messages("month_of_year"),
            ["Month of year is required for yearly schedules."]
        );
    }

    #[test]
    fn duplicate_addresses_are_rejected_case_sensitively() {
        let errors = parse(with(
            request(),
            "recipients",
            json!(["admin@district.org", "admin@district.org"]),
        ))
        .unwrap_err();
        assert_eq!(errors.messages("recipients"), ["Recipient emails must be unique."]);

        assert!(parse(with(
            request(),
            "recipients",
            json!(["admin@district.org", "Admin@district.org"]),
        ))
        .is_ok());

        let errors = parse(with(
            request(),
            "failure_notification_emails",
            json!(["it@district.org", "it@district.org"]),
        ))
        .unwrap_err();
        assert!(errors.has("failure_notification_emails"));
    }

    #[test]
    fn empty_failure_list_is_dropped() {
        let parsed = parse(with(request(), "failure_notification_emails", json!([]))).unwrap();
        assert!(parsed.definition.failure_notification_emails.is_empty());
    }

    #[test]
    fn fixed_ranges_that_aged_out_are_rejected() {
        let raw = with(
            request(),
            "filters",
            json!({
                "date_range_type": "fixed",
                "fixed_start_date": "2021-06-01",
                "fixed_end_date": "2021-12-31"
            }),
        );
        let errors = parse(raw).unwrap_err();
        assert_eq!(
            errors.messages("filters.fixed_start_date"),
            ["Date range starts more than 730 days before today."]
        );
    }

    #[test]
    fn fixed_ranges_are_strictly_ordered() {
        let raw = with(
            request(),
            "filters",
            json!({
                "date_range_type": "fixed",
                "fixed_start_date": "2024-01-10",
                "fixed_end_date": "2024-01-10"
            }),
        );
        let errors = parse(raw).unwrap_err();
        assert_eq!(
            errors.messages("filters.fixed_start_date"),
            ["Start date must be before end date."]
        );
        assert_eq!(
            errors.messages("filters.fixed_end_date"),
            ["End date must be after start date."]
        );
    }

    #[test]
    fn schedule_window_checks() {
        let past = with(request(), "start_date", json!("2024-01-01"));
        assert_eq!(
            parse(past).unwrap_err().messages("start_date"),
            ["Schedule start date cannot be in the past."]
        );

        let long = with(
            with(request(), "start_date", json!("2024-03-01")),
            "end_date",
            json!("2030-03-02"),
        );
        assert_eq!(
            parse(long).unwrap_err().messages("end_date"),
            ["Schedule duration cannot exceed 5 years."]
        );

        let bounded = with(
            with(request(), "start_date", json!("2024-03-01")),
            "end_date",
            json!("2024-12-31"),
        );
        let bounded = parse(bounded).unwrap();
        assert_eq!(bounded.definition.start_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(bounded.definition.end_date, NaiveDate::from_ymd_opt(2024, 12, 31));
    }

    #[test]
    fn retries_can_be_disabled() {
        let disabled = parse(with(request(), "retry_on_failure", json!(false))).unwrap();
        assert!(!disabled.definition.retry_on_failure);
        assert_eq!(disabled.definition.max_retries, 0);

        let errors = parse(with(request(), "max_retries", json!(9))).unwrap_err();
        assert_eq!(errors.messages("max_retries"), ["Maximum retries cannot exceed 5."]);
    }

    #[test]
    fn templates_must_resolve() {
        let raw = json!({
            "report_template_id": "5f1f0c7e-0000-4000-8000-000000000000",
            "title": "From Template",
            "frequency": "daily",
            "time": "06:00",
            "recipients": ["admin@district.org"],
            "filters": {"date_range_type": "relative", "relative_period": "last_week"}
        });
        let errors = parse(raw).unwrap_err();
        assert_eq!(
            errors.messages("report_template_id"),
            ["Selected report template does not exist."]
        );
    }
}
