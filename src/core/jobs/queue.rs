#![allow(clippy::result_large_err)]

use super::schedule::JobSchedule;
use crate::core::config::JobsConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex};

const EVENT_CAPACITY: usize = 256;

/// A job definition as registered by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemJob {
    /// Upsert key. Defaults to the job name.
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub schedule: JobSchedule,
}

impl SystemJob {
    pub fn new(name: &str, payload: Value, schedule: JobSchedule) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            payload,
            schedule,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Scheduled,
    Running,
    Completed,
    Failed,
}

/// Queue-side view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job: SystemJob,
    pub state: JobState,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Failed attempts for the current firing.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Bumped on every upsert; deliveries of an older registration cannot settle this one.
    #[serde(default)]
    pub generation: u64,
}

/// One firing handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDelivery {
    pub job_id: String,
    pub name: String,
    pub payload: Value,
    /// 1 for the first delivery of a firing.
    pub attempt: u32,
    /// Generation of the registration this firing came from.
    pub claim: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Completed { job_id: String },
    Failed { job_id: String, reason: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Completed { job_id } | JobEvent::Failed { job_id, .. } => job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying { at: DateTime<Utc>, attempt: u32 },
    Exhausted,
    /// The job was replaced or re-armed while this firing ran; nothing was recorded.
    Superseded,
}

/// Transport for system jobs. Delivery is at least once: a firing is handed
/// out again until it is completed or its retries run out.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Register or replace the job with the same id. Returns its next fire time.
    async fn upsert(&self, job: SystemJob, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError>;
    async fn remove(&self, job_id: &str) -> Result<bool, AppError>;
    /// Claim up to `limit` jobs whose fire time is at or before `now`.
    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobDelivery>, AppError>;
    /// Settle a firing as done. Returns false when `claim` is stale.
    async fn complete(&self, job_id: &str, claim: u64, now: DateTime<Utc>) -> Result<bool, AppError>;
    /// Record a failed attempt; `payload` replaces the stored one so progress survives.
    async fn fail(
        &self,
        job_id: &str,
        claim: u64,
        reason: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, AppError>;
    async fn lookup(&self, job_id: &str) -> Result<Option<QueuedJob>, AppError>;
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

/// Process-local queue. Terminal jobs are kept so completion handlers can
/// still look them up.
pub struct InMemoryJobQueue {
    jobs: Mutex<HashMap<String, QueuedJob>>,
    events: broadcast::Sender<JobEvent>,
    generations: AtomicU64,
    max_attempts: u32,
    backoff_ms: u64,
}

impl InMemoryJobQueue {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: Mutex::new(HashMap::new()),
            events,
            generations: AtomicU64::new(0),
            max_attempts: max_attempts.max(1),
            backoff_ms,
        }
    }

    pub fn from_config(config: &JobsConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_ms)
    }

    fn backoff(&self, attempt: u32) -> chrono::Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        chrono::Duration::milliseconds(self.backoff_ms.saturating_mul(factor).min(i64::MAX as u64) as i64)
    }

    fn emit(&self, event: JobEvent) {
        // No receivers just means nobody is listening yet.
        let _ = self.events.send(event);
    }
}

fn unknown_job(job_id: &str) -> AppError {
    AppError::new(ErrorCategory::JobError, format!("job '{}' is not queued", job_id))
        .with_code("JOB-004")
}

/// Move a finished firing to its next slot, or park it as terminal.
fn advance(entry: &mut QueuedJob, now: DateTime<Utc>, terminal: JobState) -> Result<(), AppError> {
    entry.attempts = 0;
    match entry.job.schedule.next_after(now)? {
        Some(next) => {
            entry.state = JobState::Scheduled;
            entry.next_run_at = Some(next);
        }
        None => {
            entry.state = terminal;
            entry.next_run_at = None;
        }
    }
    Ok(())
}

/// The entry a settlement may touch: still running under the same registration.
fn claimed<'a>(
    jobs: &'a mut HashMap<String, QueuedJob>,
    job_id: &str,
    claim: u64,
) -> Result<Option<&'a mut QueuedJob>, AppError> {
    let entry = jobs.get_mut(job_id).ok_or_else(|| unknown_job(job_id))?;
    if entry.generation != claim || entry.state != JobState::Running {
        tracing::debug!(job_id, claim, current = entry.generation, "stale settlement ignored");
        return Ok(None);
    }
    Ok(Some(entry))
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn upsert(&self, job: SystemJob, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        let next = job.schedule.first_fire(now)?;
        let job_id = job.id.clone();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut jobs = self.jobs.lock().await;
        let replaced = jobs
            .insert(
                job_id.clone(),
                QueuedJob {
                    job,
                    state: JobState::Scheduled,
                    next_run_at: Some(next),
                    attempts: 0,
                    last_error: None,
                    generation,
                },
            )
            .is_some();
        tracing::debug!(job_id = %job_id, replaced, next_run_at = %next, "job upserted");
        Ok(next)
    }

    async fn remove(&self, job_id: &str) -> Result<bool, AppError> {
        Ok(self.jobs.lock().await.remove(job_id).is_some())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobDelivery>, AppError> {
        let mut jobs = self.jobs.lock().await;
        let mut due: Vec<&mut QueuedJob> = jobs
            .values_mut()
            .filter(|entry| {
                entry.state == JobState::Scheduled
                    && entry.next_run_at.map(|at| at <= now).unwrap_or(false)
            })
            .collect();
        due.sort_by_key(|entry| entry.next_run_at);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.state = JobState::Running;
                JobDelivery {
                    job_id: entry.job.id.clone(),
                    name: entry.job.name.clone(),
                    payload: entry.job.payload.clone(),
                    attempt: entry.attempts + 1,
                    claim: entry.generation,
                }
            })
            .collect())
    }

    async fn complete(&self, job_id: &str, claim: u64, now: DateTime<Utc>) -> Result<bool, AppError> {
        {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = claimed(&mut jobs, job_id, claim)? else {
                return Ok(false);
            };
            entry.last_error = None;
            advance(entry, now, JobState::Completed)?;
        }
        self.emit(JobEvent::Completed {
            job_id: job_id.to_string(),
        });
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: &str,
        claim: u64,
        reason: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, AppError> {
        let outcome = {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = claimed(&mut jobs, job_id, claim)? else {
                return Ok(FailOutcome::Superseded);
            };
            entry.job.payload = payload;
            entry.last_error = Some(reason.to_string());
            entry.attempts += 1;
            if entry.attempts < self.max_attempts {
                let at = now + self.backoff(entry.attempts);
                entry.state = JobState::Scheduled;
                entry.next_run_at = Some(at);
                FailOutcome::Retrying {
                    at,
                    attempt: entry.attempts,
                }
            } else {
                advance(entry, now, JobState::Failed)?;
                FailOutcome::Exhausted
            }
        };
        if outcome == FailOutcome::Exhausted {
            self.emit(JobEvent::Failed {
                job_id: job_id.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(outcome)
    }

    async fn lookup(&self, job_id: &str) -> Result<Option<QueuedJob>, AppError> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
