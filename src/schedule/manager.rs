use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{PendingRetry, Schedule};
use crate::delivery::DeliveryDispatcher;
use crate::error::{ErrorKind, ReportError, ReportResult};
use crate::job::{JobStatus, ReportJob};
use crate::store::ScheduleStore;

/// Delay before each retry of a failed execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    Immediate,
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
    },
}

impl RetryPolicy {
    pub fn from_secs(initial_delay_secs: u64, max_delay_secs: u64) -> Self {
        if initial_delay_secs == 0 {
            Self::Immediate
        } else {
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
            }
        }
    }

    /// `attempt` starts at 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Immediate => Duration::zero(),
            RetryPolicy::Exponential {
                initial_delay_secs,
                max_delay_secs,
            } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                let secs = initial_delay_secs
                    .saturating_mul(factor)
                    .min(*max_delay_secs);
                Duration::seconds(secs as i64)
            }
        }
    }
}

/// Runs one execution of a schedule's job template.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// `retry_of` names the failed job to run again as a new attempt.
    /// The returned job is terminal: completed or failed.
    async fn execute(
        &self,
        schedule: &Schedule,
        retry_of: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> ReportResult<ReportJob>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Inert or not yet due; nothing ran.
    Skipped { schedule_id: Uuid },
    Completed {
        schedule_id: Uuid,
        job_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    },
    RetryScheduled {
        schedule_id: Uuid,
        job_id: Uuid,
        attempt: u32,
        at: DateTime<Utc>,
    },
    /// Retries exhausted or not applicable; the regular cadence resumes.
    Failed {
        schedule_id: Uuid,
        job_id: Uuid,
        notified: bool,
        next_run_at: Option<DateTime<Utc>>,
    },
}

pub struct ScheduleManager {
    schedules: Arc<dyn ScheduleStore>,
    executor: Arc<dyn JobExecutor>,
    dispatcher: Arc<DeliveryDispatcher>,
    policy: RetryPolicy,
    running: Arc<AtomicBool>,
}

impl ScheduleManager {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        executor: Arc<dyn JobExecutor>,
        dispatcher: Arc<DeliveryDispatcher>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            schedules,
            executor,
            dispatcher,
            policy,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn register(&self, schedule: Schedule) -> ReportResult<Schedule> {
        self.schedules.insert(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            frequency = %schedule.definition.frequency,
            next_run_at = ?schedule.next_run_at,
            "schedule registered"
        );
        Ok(schedule)
    }

    /// Run every schedule due at `now`, oldest trigger first.
    pub async fn run_due(&self, now: DateTime<Utc>) -> ReportResult<Vec<ExecutionOutcome>> {
        let due = self.schedules.due(now).await?;
        debug!(count = due.len(), "due schedules");
        let mut outcomes = Vec::with_capacity(due.len());
        for schedule in due {
            match self.execute(schedule.id, now).await {
                Ok(outcome) => outcomes.push(outcome),
                // One broken schedule must not hold back the rest of the tick.
                Err(err) => {
                    error!(schedule_id = %schedule.id, error = %err, "scheduled execution aborted");
                }
            }
        }
        Ok(outcomes)
    }

    /// Run `schedule_id` once if it is due, then decide what happens next.
    pub async fn execute(&self, schedule_id: Uuid, now: DateTime<Utc>) -> ReportResult<ExecutionOutcome> {
        let schedule = self
            .schedules
            .get(schedule_id)
            .await?
            .ok_or_else(|| ReportError::NotFound(format!("schedule {schedule_id}")))?;
        if !schedule.is_due(now) {
            debug!(schedule_id = %schedule_id, "schedule not due or inert; trigger ignored");
            return Ok(ExecutionOutcome::Skipped { schedule_id });
        }
        let Some(slot) = schedule.retry.map(|retry| retry.slot).or(schedule.next_run_at) else {
            return Ok(ExecutionOutcome::Skipped { schedule_id });
        };
        let attempt = schedule.retry.map_or(0, |retry| retry.attempt);
        let retry_of = schedule.retry.and(schedule.last_job_id);

        let job = self.executor.execute(&schedule, retry_of, now).await?;

        // Edits made while the job ran apply from the next computed occurrence on.
        let mut current = self
            .schedules
            .get(schedule_id)
            .await?
            .unwrap_or(schedule);
        current.last_run_at = Some(now);
        current.last_job_id = Some(job.id);
        current.last_status = Some(job.status);
        current.updated_at = now;

        let outcome = if job.status == JobStatus::Completed {
            current.retry = None;
            current.execution_count += 1;
            current.next_run_at = self.next_regular_run(&current, slot, now);
            info!(
                schedule_id = %schedule_id,
                job_id = %job.id,
                next_run_at = ?current.next_run_at,
                "scheduled execution completed"
            );
            ExecutionOutcome::Completed {
                schedule_id,
                job_id: job.id,
                next_run_at: current.next_run_at,
            }
        } else {
            let kind = job.error_kind.unwrap_or(ErrorKind::Internal);
            let message = job
                .error_message
                .clone()
                .unwrap_or_else(|| kind.to_string());
            let retryable = kind.is_retryable()
                && current.definition.retry_on_failure
                && attempt < current.definition.max_retries;

            if retryable {
                let next_attempt = attempt + 1;
                let at = now + self.policy.delay_for_attempt(next_attempt);
                current.retry = Some(PendingRetry {
                    attempt: next_attempt,
                    at,
                    slot,
                });
                warn!(
                    schedule_id = %schedule_id,
                    job_id = %job.id,
                    attempt = next_attempt,
                    error = %message,
                    "scheduled execution failed; retry queued"
                );
                ExecutionOutcome::RetryScheduled {
                    schedule_id,
                    job_id: job.id,
                    attempt: next_attempt,
                    at,
                }
            } else {
                current.retry = None;
                current.execution_count += 1;
                current.next_run_at = self.next_regular_run(&current, slot, now);
                let notify = kind != ErrorKind::Cancelled
                    && !current.definition.failure_notification_emails.is_empty();
                error!(
                    schedule_id = %schedule_id,
                    job_id = %job.id,
                    attempts = attempt + 1,
                    error = %message,
                    "scheduled execution failed"
                );
                let notified = notify
                    && self
                        .dispatcher
                        .notify_failure(
                            &current.definition.failure_notification_emails,
                            &current.title,
                            &message,
                            now,
                        )
                        .await
                        .is_ok();
                ExecutionOutcome::Failed {
                    schedule_id,
                    job_id: job.id,
                    notified,
                    next_run_at: current.next_run_at,
                }
            }
        };

        self.schedules.update(&current).await?;
        Ok(outcome)
    }

    /// Next occurrence after the slot that just finished, skipping any already in the past.
    fn next_regular_run(
        &self,
        schedule: &Schedule,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if schedule.is_inert(now) {
            return None;
        }
        let next = schedule.definition.next_run_after(slot)?;
        if next > now {
            Some(next)
        } else {
            schedule.definition.next_run_after(now)
        }
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Poll for due schedules until `running` is cleared.
    pub async fn serve(&self, poll: StdDuration) {
        self.running.store(true, Ordering::SeqCst);
        info!(poll_secs = poll.as_secs(), "scheduler started");
        while self.running.load(Ordering::SeqCst) {
            match self.run_due(Utc::now()).await {
                Ok(outcomes) if !outcomes.is_empty() => {
                    info!(executions = outcomes.len(), "scheduler tick");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "scheduler tick failed"),
            }
            tokio::time::sleep(poll).await;
        }
        info!("scheduler stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
