use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::{Frequency, ScheduleDefinition};

/// Longest gap between two occurrences of any frequency, with slack.
const MAX_SCAN_DAYS: u32 = 800;

const QUARTER_MONTHS: [u32; 4] = [1, 4, 7, 10];

fn matches(definition: &ScheduleDefinition, date: NaiveDate) -> bool {
    let day = definition.day_of_month.unwrap_or(1);
    match definition.frequency {
        Frequency::Daily => true,
        Frequency::Weekly => {
            date.weekday().num_days_from_sunday() == definition.day_of_week.unwrap_or(1)
        }
        Frequency::Monthly => date.day() == day,
        Frequency::Quarterly => QUARTER_MONTHS.contains(&date.month()) && date.day() == day,
        Frequency::Yearly => {
            date.month() == definition.month_of_year.unwrap_or(1) && date.day() == day
        }
    }
}

/// Local wall time to UTC. Ambiguous times take the earlier instant; times
/// skipped by a DST jump move forward by an hour.
fn localize(timezone: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match timezone.from_local_datetime(&local) {
        LocalResult::Single(at) => Some(at.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => timezone
            .from_local_datetime(&(local + Duration::hours(1)))
            .earliest()
            .map(|at| at.with_timezone(&Utc)),
    }
}

/// First occurrence strictly after `after`, or `None` past the end date.
pub fn next_occurrence(
    definition: &ScheduleDefinition,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut date = after.with_timezone(&definition.timezone).date_naive();
    if let Some(start) = definition.start_date {
        date = date.max(start);
    }
    for _ in 0..MAX_SCAN_DAYS {
        if definition.end_date.is_some_and(|end| date > end) {
            return None;
        }
        if matches(definition, date) {
            if let Some(at) = localize(definition.timezone, date.and_time(definition.time)) {
                if at > after {
                    return Some(at);
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn definition(frequency: Frequency) -> ScheduleDefinition {
        ScheduleDefinition {
            frequency,
            day_of_week: None,
            day_of_month: None,
            month_of_year: None,
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            timezone: Tz::UTC,
            recipients: vec!["admin@district.org".to_string()],
            is_active: true,
            start_date: None,
            end_date: None,
            max_executions: None,
            retry_on_failure: true,
            max_retries: 3,
            failure_notification_emails: Vec::new(),
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn daily_runs_later_today_or_tomorrow() {
        let daily = definition(Frequency::Daily);
        assert_eq!(
            next_occurrence(&daily, utc(2024, 1, 10, 8, 0)),
            Some(utc(2024, 1, 10, 9, 0))
        );
        assert_eq!(
            next_occurrence(&daily, utc(2024, 1, 10, 9, 0)),
            Some(utc(2024, 1, 11, 9, 0))
        );
    }

    #[test]
    fn weekly_counts_days_from_sunday() {
        let mut weekly = definition(Frequency::Weekly);
        weekly.day_of_week = Some(0);
        // 2024-01-01 is a Monday.
        assert_eq!(
            next_occurrence(&weekly, utc(2024, 1, 1, 0, 0)),
            Some(utc(2024, 1, 7, 9, 0))
        );
    }

    #[test]
    fn monthly_quarterly_and_yearly_anchor_on_the_day() {
        let mut monthly = definition(Frequency::Monthly);
        monthly.day_of_month = Some(15);
        assert_eq!(
            next_occurrence(&monthly, utc(2024, 1, 20, 0, 0)),
            Some(utc(2024, 2, 15, 9, 0))
        );

        let mut quarterly = definition(Frequency::Quarterly);
        quarterly.day_of_month = Some(5);
        assert_eq!(
            next_occurrence(&quarterly, utc(2024, 1, 20, 0, 0)),
            Some(utc(2024, 4, 5, 9, 0))
        );

        let mut yearly = definition(Frequency::Yearly);
        yearly.month_of_year = Some(9);
        yearly.day_of_month = Some(1);
        assert_eq!(
            next_occurrence(&yearly, utc(2024, 9, 1, 10, 0)),
            Some(utc(2025, 9, 1, 9, 0))
        );
    }

    #[test]
    fn honours_start_and_end_dates() {
        let mut daily = definition(Frequency::Daily);
        daily.start_date = NaiveDate::from_ymd_opt(2024, 3, 1);
        daily.end_date = NaiveDate::from_ymd_opt(2024, 3, 2);
        assert_eq!(
            next_occurrence(&daily, utc(2024, 1, 1, 0, 0)),
            Some(utc(2024, 3, 1, 9, 0))
        );
        assert_eq!(next_occurrence(&daily, utc(2024, 3, 2, 9, 0)), None);
    }

    #[test]
    fn local_time_follows_the_timezone() {
        let mut daily = definition(Frequency::Daily);
        daily.timezone = chrono_tz::America::New_York;
        // 09:00 EST is 14:00 UTC.
        assert_eq!(
            next_occurrence(&daily, utc(2024, 1, 10, 0, 0)),
            Some(utc(2024, 1, 10, 14, 0))
        );
    }

    #[test]
    fn times_skipped_by_dst_move_forward() {
        let mut daily = definition(Frequency::Daily);
        daily.timezone = chrono_tz::America::New_York;
        daily.time = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        // 2024-03-10 02:30 does not exist in New York; 03:30 EDT is 07:30 UTC.
        assert_eq!(
            next_occurrence(&daily, utc(2024, 3, 10, 0, 0)),
            Some(utc(2024, 3, 10, 7, 30))
        );
    }
}
