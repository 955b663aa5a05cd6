use chrono_tz::Tz;
use serde_json::{json, Value};

use super::filters::{check_school_district, read_inclusive_dates, read_shared, span_exceeds};
use super::schedule::{
    check_day_of_month, default_email_delivery, read_recipients, DAY_OF_MONTH_RANGE,
    DAY_OF_WEEK_RANGE,
};
use super::{default_at, slug, strip_empty, Fields};
use crate::aggregate::{Aggregation, GroupBy};
use crate::artifact::ArtifactOptions;
use crate::delivery::DeliveryTarget;
use crate::error::ValidationErrors;
use crate::filter::{
    range_age_error, DateRange, FilterSpecification, RelativePeriod, ValidationContext,
    REPORT_MAX_SPAN_DAYS,
};
use crate::job::JobDefinition;
use crate::models::{ExportFormat, ReportType};
use crate::render::RenderOptions;
use crate::schedule::{Frequency, ScheduleDefinition};
use crate::table::SortDirection;

const DEFAULT_SCHEDULE_TIME: &str = "09:00";

/// A validated immediate report plus the optional recurring schedule requested alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub definition: JobDefinition,
    pub schedule: Option<ScheduleDefinition>,
}

impl GenerateRequest {
    /// Job template for the nested schedule: this report, emailed to the schedule's recipients.
    pub fn schedule_template(&self) -> Option<JobDefinition> {
        let schedule = self.schedule.as_ref()?;
        Some(JobDefinition {
            delivery: default_email_delivery(&self.definition.title, &schedule.recipients),
            ..self.definition.clone()
        })
    }
}

pub fn normalize_generate(raw: &Value, ctx: &ValidationContext<'_>) -> Value {
    let mut input = strip_empty(raw);
    default_at(&mut input, "format", json!("pdf"));
    if input.get("filters").is_some_and(Value::is_object) {
        default_at(&mut input, "filters.date_range", json!("month"));
    }
    default_at(&mut input, "include_charts", json!(true));
    default_at(&mut input, "include_raw_data", json!(false));
    if input.get("schedule").is_some_and(Value::is_object) {
        default_at(&mut input, "schedule.time", json!(DEFAULT_SCHEDULE_TIME));
        default_at(&mut input, "schedule.timezone", json!(ctx.timezone.name()));
    }
    input
}

pub fn parse_generate(raw: &Value, ctx: &ValidationContext<'_>) -> Result<GenerateRequest, ValidationErrors> {
    validate_generate(&normalize_generate(raw, ctx), ctx)
}

pub fn validate_generate(
    input: &Value,
    ctx: &ValidationContext<'_>,
) -> Result<GenerateRequest, ValidationErrors> {
    let mut fields = Fields::new(input);

    let report_type = if fields.require("report_type", "Report type is required.") {
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

    let title = read_title(&mut fields, "Report");
    let description = fields.bounded_string(
        "description",
        "report description",
        1000,
        "Description cannot exceed 1000 characters.",
    );
    let format = report_format(&mut fields);

    let mut date_range = None;
    let mut custom_dates = (None, None);
    if fields.require("filters", "At least one filter must be specified.") {
        let range = fields.string("filters.date_range", "date range");
        match range.as_deref() {
            Some("custom") => {
                fields.require("filters.start_date", "Start date is required for custom date range.");
                fields.require("filters.end_date", "End date is required for custom date range.");
                custom_dates = read_inclusive_dates(&mut fields, ctx.today());
                if let (Some(start), Some(end)) = custom_dates {
                    date_range = Some(DateRange::Fixed {
                        start: Some(start),
                        end: Some(end),
                    });
                }
            }
            Some(value @ ("week" | "month" | "quarter" | "year")) => {
                read_inclusive_dates(&mut fields, ctx.today());
                date_range = RelativePeriod::parse(value).map(|period| DateRange::Relative { period });
            }
            Some(_) => fields.fail("filters.date_range", "Invalid date range selected."),
            None => {}
        }
    }
    let shared = read_shared(&mut fields, ctx);

    let include_charts = fields.boolean("include_charts", "include charts").unwrap_or(true);
    let include_raw_data = fields
        .boolean("include_raw_data", "include raw data")
        .unwrap_or(false);
    let group_by = fields.string("group_by", "group by").and_then(|value| {
        let parsed = GroupBy::parse(&value).filter(|group_by| group_by.is_temporal());
        if parsed.is_none() {
            fields.fail("group_by", "Invalid grouping option selected.");
        }
        parsed
    });
    let limit = fields.integer_in(
        "limit",
        "record limit",
        (1, "Report limit must be at least 1."),
        (50_000, "Report limit cannot exceed 50,000 records."),
    );

    let schedule = if fields.has("schedule") {
        read_nested_schedule(&mut fields)
    } else {
        None
    };

    if !fields.is_clean() {
        return Err(fields.finish());
    }
    let (Some(report_type), Some(title), Some(format), Some(date_range)) =
        (report_type, title, format, date_range)
    else {
        return Err(fields.finish());
    };

    // Cross-field rules.
    if let (Some(start), Some(end)) = custom_dates {
        if span_exceeds(start, end, REPORT_MAX_SPAN_DAYS) {
            fields.fail("filters.end_date", "Date range cannot exceed 2 years.");
        }
        if let Some(message) = range_age_error(start, ctx.today(), REPORT_MAX_SPAN_DAYS) {
            fields.fail("filters.start_date", message);
        }
    }
    check_school_district(&mut fields, ctx, &shared.scope);
    if let Some(limit) = limit {
        let max = format.max_rows();
        if limit as usize > max {
            fields.fail(
                "limit",
                format!("Maximum records allowed for {format} format is {max}."),
            );
        }
    }
    if let Some(schedule) = &schedule {
        check_day_of_month(&mut fields, "schedule.day_of_month", schedule);
    }
    if !fields.is_clean() {
        return Err(fields.finish());
    }

    let mut filter = FilterSpecification::new(report_type.data_type(), date_range, REPORT_MAX_SPAN_DAYS);
    filter.scope = shared.scope;
    filter.status = shared.status;
    filter.bounds = shared.bounds;

    let definition = JobDefinition {
        report_type: Some(report_type),
        filename: slug(&title),
        title,
        description,
        format,
        filter,
        aggregation: group_by.map(|group_by| Aggregation::new(group_by, Vec::new())),
        sort_by: None,
        sort_direction: SortDirection::Desc,
        limit: limit.map(|limit| limit as usize),
        render: RenderOptions::default(),
        artifact: ArtifactOptions::default(),
        delivery: DeliveryTarget::Download,
        include_charts,
        include_raw_data,
    };
    Ok(GenerateRequest {
        definition,
        schedule,
    })
}

/// `noun` is "Report" or "Schedule".
pub(super) fn read_title(fields: &mut Fields<'_>, noun: &str) -> Option<String> {
    if !fields.require("title", &format!("{noun} title is required.")) {
        return None;
    }
    let title = fields.string("title", "title")?;
    let length = title.chars().count();
    if length < 3 {
        fields.fail("title", format!("{noun} title must be at least 3 characters."));
        None
    } else if length > 255 {
        fields.fail("title", format!("{noun} title cannot exceed 255 characters."));
        None
    } else {
        Some(title)
    }
}

/// Generated and scheduled reports come as pdf, excel or csv.
pub(super) fn report_format(fields: &mut Fields<'_>) -> Option<ExportFormat> {
    if !fields.require("format", "Report format is required.") {
        return None;
    }
    let value = fields.string("format", "format")?;
    match ExportFormat::parse(&value) {
        Some(format) if format != ExportFormat::Json => Some(format),
        _ => {
            fields.fail("format", "Invalid format selected. Choose from PDF, Excel, or CSV.");
            None
        }
    }
}

fn read_nested_schedule(fields: &mut Fields<'_>) -> Option<ScheduleDefinition> {
    let frequency = if fields.require(
        "schedule.frequency",
        "Schedule frequency is required when scheduling is enabled.",
    ) {
        fields
            .string("schedule.frequency", "schedule frequency")
            .and_then(|value| {
                let parsed = Frequency::parse(&value).filter(|frequency| *frequency != Frequency::Yearly);
                if parsed.is_none() {
                    fields.fail("schedule.frequency", "Invalid schedule frequency selected.");
                }
                parsed
            })
    } else {
        None
    };

    if frequency == Some(Frequency::Weekly) {
        fields.require("schedule.day_of_week", "Day of week is required for weekly schedules.");
    }
    if frequency == Some(Frequency::Monthly) {
        fields.require("schedule.day_of_month", "Day of month is required for monthly schedules.");
    }
    let day_of_week = fields.integer_in(
        "schedule.day_of_week",
        "day of week",
        DAY_OF_WEEK_RANGE.0,
        DAY_OF_WEEK_RANGE.1,
    );
    let day_of_month = fields.integer_in(
        "schedule.day_of_month",
        "day of month",
        DAY_OF_MONTH_RANGE.0,
        DAY_OF_MONTH_RANGE.1,
    );
    let time = fields.time(
        "schedule.time",
        "schedule time",
        "Schedule time must be in HH:MM format.",
    );
    let timezone = fields
        .string("schedule.timezone", "timezone")
        .and_then(|name| match name.parse::<Tz>() {
            Ok(timezone) => Some(timezone),
            Err(_) => {
                fields.fail("schedule.timezone", "Invalid timezone specified.");
                None
            }
        });
    let recipients = read_recipients(fields, "schedule.recipients");

    Some(ScheduleDefinition {
        frequency: frequency?,
        day_of_week: day_of_week.map(|day| day as u32),
        day_of_month: day_of_month.map(|day| day as u32),
        month_of_year: None,
        time: time?,
        timezone: timezone?,
        recipients: recipients?,
        is_active: true,
        start_date: None,
        end_date: None,
        max_executions: None,
        retry_on_failure: true,
        max_retries: 3,
        failure_notification_emails: Vec::new(),
    })
}
