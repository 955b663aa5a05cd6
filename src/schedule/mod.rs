//! Recurring report schedules.

mod manager;
mod recurrence;

pub use manager::{ExecutionOutcome, JobExecutor, RetryPolicy, ScheduleManager};
pub use recurrence::next_occurrence;

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobDefinition, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Monthly,
        Frequency::Quarterly,
        Frequency::Yearly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurrence rule plus retry and notification policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub frequency: Frequency,
    /// 0 = Sunday. Used by weekly schedules.
    pub day_of_week: Option<u32>,
    /// 1-28. Used by monthly, quarterly and yearly schedules.
    pub day_of_month: Option<u32>,
    /// 1-12. Used by yearly schedules.
    pub month_of_year: Option<u32>,
    pub time: NaiveTime,
    pub timezone: Tz,
    pub recipients: Vec<String>,
    pub is_active: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub max_executions: Option<u32>,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub failure_notification_emails: Vec<String>,
}

impl ScheduleDefinition {
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_occurrence(self, after)
    }
}

/// A retry waiting to fire for the occurrence at `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRetry {
    /// 1 for the first retry.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub slot: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub title: String,
    /// Job created for every execution.
    pub template: JobDefinition,
    pub definition: ScheduleDefinition,
    /// Next regular occurrence. `None` once the schedule is inert.
    pub next_run_at: Option<DateTime<Utc>>,
    pub retry: Option<PendingRetry>,
    pub execution_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<Uuid>,
    pub last_status: Option<JobStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        title: String,
        template: JobDefinition,
        definition: ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        let mut schedule = Self {
            id: Uuid::new_v4(),
            title,
            template,
            definition,
            next_run_at: None,
            retry: None,
            execution_count: 0,
            last_run_at: None,
            last_job_id: None,
            last_status: None,
            created_at: now,
            updated_at: now,
        };
        if !schedule.is_inert(now) {
            schedule.next_run_at = schedule.definition.next_run_after(now);
        }
        schedule
    }

    /// Inactive, past its end date, or out of executions.
    pub fn is_inert(&self, now: DateTime<Utc>) -> bool {
        let today = now.with_timezone(&self.definition.timezone).date_naive();
        !self.definition.is_active
            || self.definition.end_date.is_some_and(|end| today > end)
            || self
                .definition
                .max_executions
                .is_some_and(|max| self.execution_count >= max)
    }

    /// When this schedule next wants to run: a pending retry wins.
    pub fn trigger_at(&self) -> Option<DateTime<Utc>> {
        self.retry.map(|retry| retry.at).or(self.next_run_at)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_inert(now) && self.trigger_at().is_some_and(|at| at <= now)
    }
}
