#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("cron expression '{expr}' has no upcoming fire time")]
    Exhausted { expr: String },
}

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        AppError::new(ErrorCategory::JobError, err.to_string()).with_code("JOB-001")
    }
}

/// When a system job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    OneTime { at: DateTime<Utc> },
    Repeated { cron: String },
}

impl JobSchedule {
    pub fn one_time(at: DateTime<Utc>) -> Self {
        JobSchedule::OneTime { at }
    }

    /// Validate `expr` up front so bad schedules never reach the queue.
    pub fn repeated(expr: &str) -> Result<Self, ScheduleError> {
        parse_cron(expr)?;
        Ok(JobSchedule::Repeated {
            cron: expr.trim().to_string(),
        })
    }

    pub fn is_repeating(&self) -> bool {
        matches!(self, JobSchedule::Repeated { .. })
    }

    /// First fire time for a freshly registered job. One-time jobs in the past
    /// fire immediately.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            JobSchedule::OneTime { at } => Ok(*at),
            JobSchedule::Repeated { .. } => self.next_after(now)?.ok_or_else(|| self.exhausted()),
        }
    }

    /// Next fire strictly after `now`; `None` once a one-time job has fired.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            JobSchedule::OneTime { .. } => Ok(None),
            JobSchedule::Repeated { cron } => Ok(parse_cron(cron)?.after(&now).next()),
        }
    }

    fn exhausted(&self) -> ScheduleError {
        let expr = match self {
            JobSchedule::Repeated { cron } => cron.clone(),
            JobSchedule::OneTime { at } => at.to_rfc3339(),
        };
        ScheduleError::Exhausted { expr }
    }
}

/// Accepts classic five-field crontab lines as well as the seconds-first form.
fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|err| ScheduleError::InvalidCron {
        expr: trimmed.to_string(),
        reason: err.to_string(),
    })
}
