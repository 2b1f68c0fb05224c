#![allow(clippy::result_large_err)]

use super::durable::DurableProgress;
use super::queue::{FailOutcome, JobDelivery, JobEvent, JobQueue, QueuedJob, SystemJob};
use crate::core::config::JobsConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobFamily {
    /// Idempotent and stateless across firings.
    Regular,
    /// Multi-step; progress flags in the payload survive retries.
    Durable,
}

/// What a handler sees for one delivery.
pub struct JobContext {
    pub job_id: String,
    pub job_name: String,
    pub payload: Value,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn progress(&mut self) -> DurableProgress<'_> {
        DurableProgress::new(&mut self.payload)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn family(&self) -> JobFamily {
        JobFamily::Regular
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), AppError>;
}

#[derive(Default)]
pub struct JobHandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistryBuilder {
    pub fn register<H: JobHandler>(&mut self, handler: H) -> Result<(), AppError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("job handler '{}' already registered", name),
            )
            .with_code("JOB-003"));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn build(self) -> JobHandlerRegistry {
        JobHandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobHandlerRegistry {
    pub fn builder() -> JobHandlerRegistryBuilder {
        JobHandlerRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Business-level reaction to a job finishing, e.g. telling the owner of a
/// deleted flow that the delete went through.
#[async_trait]
pub trait JobCompletionHandler: Send + Sync + 'static {
    async fn on_completed(&self, job: &QueuedJob) -> Result<(), AppError>;
    async fn on_failed(&self, job: &QueuedJob, reason: &str) -> Result<(), AppError>;
}

/// Maps queue events back to job names and calls the matching handler.
#[derive(Clone)]
pub struct CompletionDispatcher {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<String, Arc<dyn JobCompletionHandler>>,
}

impl CompletionDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, job_name: &str, handler: Arc<dyn JobCompletionHandler>) {
        self.handlers.insert(job_name.to_string(), handler);
    }

    /// Returns false when the job is gone or nobody listens for its name.
    pub async fn dispatch(&self, event: &JobEvent) -> Result<bool, AppError> {
        let Some(job) = self.queue.lookup(event.job_id()).await? else {
            tracing::debug!(job_id = event.job_id(), "completion for unknown job ignored");
            return Ok(false);
        };
        let Some(handler) = self.handlers.get(&job.job.name) else {
            return Ok(false);
        };
        match event {
            JobEvent::Completed { .. } => handler.on_completed(&job).await?,
            JobEvent::Failed { reason, .. } => handler.on_failed(&job, reason).await?,
        }
        Ok(true)
    }

    pub async fn run(&self, mut events: broadcast::Receiver<JobEvent>, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if let Err(err) = self.dispatch(&event).await {
                        tracing::error!(job_id = event.job_id(), error = %err, "completion handler failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "completion dispatcher fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub dispatched: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Outcomes dropped because the job was re-registered while it ran.
    pub superseded: usize,
}

struct Settled {
    job_id: String,
    claim: u64,
    payload: Value,
    result: Result<(), AppError>,
}

/// How long `start` waits for cancelled jobs before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Polls the queue and runs due jobs on bounded concurrency.
pub struct SystemJobScheduler {
    queue: Arc<dyn JobQueue>,
    handlers: JobHandlerRegistry,
    completions: CompletionDispatcher,
    config: JobsConfig,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl SystemJobScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, handlers: JobHandlerRegistry, config: JobsConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            completions: CompletionDispatcher::new(Arc::clone(&queue)),
            queue,
            handlers,
            config,
            permits: Arc::new(Semaphore::new(concurrency)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_completion_handler(
        mut self,
        job_name: &str,
        handler: Arc<dyn JobCompletionHandler>,
    ) -> Self {
        self.completions.register(job_name, handler);
        self
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub async fn upsert_job(&self, job: SystemJob) -> Result<DateTime<Utc>, AppError> {
        let next = self.queue.upsert(job, Utc::now()).await?;
        Ok(next)
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool, AppError> {
        self.queue.remove(job_id).await
    }

    /// Run every job due at `now` that fits in the free permits, wait for
    /// all of them, then settle each outcome with the queue.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let mut running = JoinSet::new();
        let mut report = TickReport {
            dispatched: self.dispatch_due(&mut running, now).await?,
            ..TickReport::default()
        };
        while let Some(joined) = running.join_next().await {
            let settled = joined.map_err(join_failure)?;
            self.settle(settled, now, &mut report).await?;
        }
        Ok(report)
    }

    /// Poll loop. In-flight jobs live across polls, so a slow job only holds
    /// its own permit. When `token` fires every running job sees its
    /// `JobContext::cancel` fire and gets `SHUTDOWN_GRACE` to return.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut running: JoinSet<Settled> = JoinSet::new();
            let mut totals = TickReport::default();
            tracing::info!(handlers = ?self.handlers.names(), "system job scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match self.dispatch_due(&mut running, Utc::now()).await {
                            Ok(0) => {}
                            Ok(dispatched) => {
                                totals.dispatched += dispatched;
                                tracing::debug!(dispatched, in_flight = running.len(), "dispatched due jobs");
                            }
                            Err(err) => tracing::error!(error = %err, "scheduler poll failed"),
                        }
                    }
                    Some(joined) = running.join_next(), if !running.is_empty() => {
                        self.settle_joined(joined, &mut totals).await;
                    }
                }
            }

            self.shutdown.cancel();
            tracing::info!(in_flight = running.len(), "system job scheduler stopping");
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while let Some(joined) = running.join_next().await {
                    self.settle_joined(joined, &mut totals).await;
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!(abandoned = running.len(), "jobs ignored cancellation, aborting");
                running.shutdown().await;
            }
            tracing::info!(?totals, "system job scheduler stopped");
        })
    }

    /// Subscribes before returning so no event emitted afterwards is missed.
    pub fn start_completion_dispatcher(&self, token: CancellationToken) -> JoinHandle<()> {
        let events = self.queue.subscribe();
        let dispatcher = self.completions.clone();
        tokio::spawn(async move { dispatcher.run(events, token).await })
    }

    /// Claim as many due jobs as there are free permits and spawn them into `running`.
    async fn dispatch_due(
        &self,
        running: &mut JoinSet<Settled>,
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let deliveries = self.queue.take_due(now, free).await?;
        let dispatched = deliveries.len();
        for delivery in deliveries {
            let permit = Arc::clone(&self.permits).acquire_owned().await.map_err(|err| {
                AppError::new(ErrorCategory::InternalError, format!("job permits closed: {}", err))
            })?;
            let handler = self.handlers.get(&delivery.name);
            let cancel = self.shutdown.child_token();
            running.spawn(async move {
                let _permit = permit;
                execute(handler, delivery, cancel).await
            });
        }
        Ok(dispatched)
    }

    async fn settle_joined(&self, joined: Result<Settled, JoinError>, totals: &mut TickReport) {
        let outcome = match joined {
            Ok(settled) => self.settle(settled, Utc::now(), totals).await,
            Err(err) => Err(join_failure(err)),
        };
        if let Err(err) = outcome {
            tracing::error!(error = %err, "failed to settle system job");
        }
    }

    async fn settle(
        &self,
        settled: Settled,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), AppError> {
        let Settled {
            job_id,
            claim,
            payload,
            result,
        } = settled;
        let reason = match result {
            Ok(()) => {
                if self.queue.complete(&job_id, claim, now).await? {
                    report.completed += 1;
                } else {
                    report.superseded += 1;
                }
                return Ok(());
            }
            Err(err) => err.to_string(),
        };
        match self.queue.fail(&job_id, claim, &reason, payload, now).await? {
            FailOutcome::Retrying { at, attempt } => {
                tracing::warn!(job_id = %job_id, attempt, retry_at = %at, "job failed, will retry: {}", reason);
                report.retried += 1;
            }
            FailOutcome::Exhausted => {
                tracing::error!(job_id = %job_id, "job failed permanently: {}", reason);
                report.failed += 1;
            }
            FailOutcome::Superseded => {
                tracing::info!(job_id = %job_id, "job was re-registered while running, failure dropped");
                report.superseded += 1;
            }
        }
        Ok(())
    }
}

fn join_failure(err: JoinError) -> AppError {
    AppError::new(ErrorCategory::JobError, format!("job task did not finish: {}", err))
        .with_code("JOB-005")
}

async fn execute(
    handler: Option<Arc<dyn JobHandler>>,
    delivery: JobDelivery,
    cancel: CancellationToken,
) -> Settled {
    let Some(handler) = handler else {
        return Settled {
            result: Err(AppError::new(
                ErrorCategory::JobError,
                format!("no handler registered for job '{}'", delivery.name),
            )
            .with_code("JOB-002")),
            job_id: delivery.job_id,
            claim: delivery.claim,
            payload: delivery.payload,
        };
    };

    let original = delivery.payload.clone();
    let claim = delivery.claim;
    let mut ctx = JobContext {
        job_id: delivery.job_id,
        job_name: delivery.name,
        payload: delivery.payload,
        attempt: delivery.attempt,
        cancel,
    };
    tracing::info!(job_id = %ctx.job_id, job = %ctx.job_name, attempt = ctx.attempt, "running system job");
    let outcome = AssertUnwindSafe(handler.run(&mut ctx)).catch_unwind().await;
    let result = match outcome {
        Ok(result) => result,
        Err(_) => Err(AppError::new(
            ErrorCategory::JobError,
            format!("job '{}' panicked", ctx.job_name),
        )
        .with_code("JOB-005")),
    };
    let payload = match handler.family() {
        JobFamily::Durable => ctx.payload,
        JobFamily::Regular => original,
    };
    Settled {
        job_id: ctx.job_id,
        claim,
        payload,
        result,
    }
}
