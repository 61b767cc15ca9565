// src/core/scheduler.rs

//! Cron-driven recurring tasks.
//!
//! Each [`RecurringTaskScheduler`] owns one task and exactly one pending timer. After
//! every firing, whatever the outcome of the task body, the next occurrence is
//! computed from the current time and a fresh timer replaces the old one.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::eyre;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no schedule configured for task {task:?}")]
    Missing { task: String },
    #[error("cron expression {expression:?} must have 5, 6 or 7 fields")]
    FieldCount { expression: String },
    #[error("invalid cron expression {expression:?}: {source}")]
    Invalid {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("cron expression {expression:?} has a day of week outside 0-7")]
    DayOfWeek { expression: String },
    #[error("cron expression {expression:?} has no upcoming occurrence")]
    NoUpcoming { expression: String },
}

// --- Clock ---

/// Source of "now" for schedule computations.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time that follows tokio's clock, so paused-time tests can move both.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default();
        self.origin + elapsed
    }
}

// --- Cron Schedule ---

/// A cron expression and the next time it fires.
///
/// Accepts standard 5-field expressions (`min hour dom month dow`, Sunday = 0 or 7)
/// as well as the 6/7-field form with leading seconds understood by the `cron` crate.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
    next_fire_time: Option<DateTime<Utc>>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let normalized = normalize_expression(expression)?;
        let schedule = cron::Schedule::from_str(&normalized).map_err(|source| ScheduleError::Invalid {
            expression: expression.to_string(),
            source,
        })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            next_fire_time: None,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Recomputes and stores the next fire time relative to `now`.
    ///
    /// Never returns the occurrence that just fired, even if the timer woke up a
    /// little before the clock reached it.
    fn advance(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let reference = match self.next_fire_time {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        let next = self.next_after(reference).ok_or_else(|| ScheduleError::NoUpcoming {
            expression: self.expression.clone(),
        })?;
        self.next_fire_time = Some(next);
        Ok(next)
    }
}

fn normalize_expression(expression: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week =
                translate_day_of_week(fields[4]).ok_or_else(|| ScheduleError::DayOfWeek {
                    expression: expression.to_string(),
                })?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], day_of_week
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        _ => Err(ScheduleError::FieldCount {
            expression: expression.to_string(),
        }),
    }
}

/// Maps standard cron weekday numbers (0-7, Sunday = 0 and 7) onto the `cron`
/// crate's numbering (1-7, Sunday = 1). Names pass through unchanged.
///
/// Returns `None` when a day number or step is out of range.
fn translate_day_of_week(field: &str) -> Option<String> {
    let shift = |day: &str| match day.parse::<u32>() {
        Ok(0) | Ok(7) => Some("1".to_string()),
        Ok(n) if n < 7 => Some((n + 1).to_string()),
        Ok(_) => None,
        Err(_) => Some(day.to_string()),
    };

    let items = field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let translated = match (range.split_once('-'), step) {
                // Sunday to Sunday is the whole week.
                (Some(("0", "7")), _) => "1-7".to_string(),
                // A range ending on Sunday wraps: Saturday is the last `cron` day.
                (Some((start, "7")), None) if start != "7" => format!("{}-7,1", shift(start)?),
                (Some((start, "7")), Some(step)) if start != "7" => {
                    return wrapped_days(start, step);
                }
                (Some((start, end)), _) => format!("{}-{}", shift(start)?, shift(end)?),
                (None, _) => shift(range)?,
            };
            Some(match step {
                Some(step) => format!("{translated}/{step}"),
                None => translated,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(items.join(","))
}

/// Lists the days of a stepped range that ends on Sunday, e.g. `1-7/2`.
fn wrapped_days(start: &str, step: &str) -> Option<String> {
    let start = start.parse::<usize>().ok().filter(|day| *day < 7)?;
    let step = step.parse::<usize>().ok().filter(|step| *step > 0)?;
    let days: Vec<String> = (start..=7)
        .step_by(step)
        .map(|day| (if day == 7 { 1 } else { day + 1 }).to_string())
        .collect();
    Some(days.join(","))
}

// --- Scheduler ---

/// Body of a recurring task.
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()>;
}

/// Fires one task at every occurrence of its cron schedule until cancelled.
pub struct RecurringTaskScheduler {
    name: String,
    schedule: CronSchedule,
    clock: Arc<dyn Clock>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl RecurringTaskScheduler {
    /// # Arguments
    /// * `name` - Task name, used in logs and to look up its schedule.
    /// * `expression` - Cron expression; `None` is a configuration error.
    /// * `clock` - Time source for computing occurrences.
    pub fn new(
        name: &str,
        expression: Option<&str>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| ScheduleError::Missing {
                task: name.to_string(),
            })?;
        Ok(Self {
            name: name.to_string(),
            schedule: CronSchedule::parse(expression)?,
            clock,
            timer: None,
        })
    }

    /// Resolves the task's schedule from a `task name -> cron expression` map.
    pub fn from_schedules(
        name: &str,
        schedules: &BTreeMap<String, String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ScheduleError> {
        Self::new(name, schedules.get(name).map(String::as_str), clock)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Computes the next occurrence and replaces the pending timer with one for it.
    fn arm(&mut self) -> Result<DateTime<Utc>, ScheduleError> {
        let now = self.clock.now();
        let next = self.schedule.advance(now)?;
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        self.timer = Some(Box::pin(sleep(delay)));
        info!(
            task = %self.name,
            next_fire = %next,
            delay_secs = delay.as_secs(),
            "Next occurrence scheduled."
        );
        Ok(next)
    }

    /// Runs the schedule until `cancel` fires.
    ///
    /// Task failures and panics are logged and never stop the schedule. Only an
    /// expression without further occurrences ends the loop with an error.
    pub async fn run(
        mut self,
        task: Arc<dyn ScheduledTask>,
        cancel: CancellationToken,
    ) -> Result<(), ScheduleError> {
        info!(task = %self.name, schedule = %self.schedule.expression(), "Timed task scheduler running.");
        loop {
            self.arm()?;
            let Some(timer) = self.timer.as_mut() else {
                continue;
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(task = %self.name, "Timed task scheduler stopping.");
                    return Ok(());
                }
                _ = timer.as_mut() => {}
            }
            self.fire(&task, &cancel).await;
        }
    }

    /// Spawns [`run`](Self::run) onto the runtime.
    pub fn spawn(
        self,
        task: Arc<dyn ScheduledTask>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), ScheduleError>> {
        tokio::spawn(self.run(task, cancel))
    }

    async fn fire(&self, task: &Arc<dyn ScheduledTask>, cancel: &CancellationToken) {
        info!(task = %self.name, "Executing timed task.");
        let body = {
            let task = Arc::clone(task);
            let token = cancel.child_token();
            tokio::spawn(async move { task.run(token).await })
        };
        match body.await {
            Ok(Ok(())) => info!(task = %self.name, "Finished timed task."),
            Ok(Err(err)) => error!(task = %self.name, error = ?err, "Timed task failed."),
            Err(join_err) => error!(task = %self.name, error = %join_err, "Timed task panicked."),
        }
    }
}
