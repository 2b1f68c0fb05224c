#![allow(clippy::result_large_err)]

use super::queue::SystemJob;
use super::schedule::{JobSchedule, ScheduleError};
use super::scheduler::{JobContext, JobFamily, JobHandler};
use crate::core::builder::ArtifactCache;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

pub const DELETE_FLOW_JOB: &str = "delete-flow";
pub const PRUNE_ARTIFACT_CACHE_JOB: &str = "prune-artifact-cache";

pub const PRE_DELETE_DONE: &str = "preDeleteDone";
pub const DB_DELETE_DONE: &str = "dbDeleteDone";

/// Side effects of deleting a flow. Both calls must tolerate being repeated.
#[async_trait]
pub trait FlowDeletionService: Send + Sync + 'static {
    /// Detach triggers and other external hooks.
    async fn pre_delete(&self, flow_id: &str) -> Result<(), AppError>;
    async fn delete_from_db(&self, flow_id: &str) -> Result<(), AppError>;
}

pub struct DeleteFlowJob {
    service: Arc<dyn FlowDeletionService>,
}

impl DeleteFlowJob {
    pub fn new(service: Arc<dyn FlowDeletionService>) -> Self {
        Self { service }
    }

    /// One-time job firing now, keyed per flow so a second request replaces the first.
    pub fn job(flow_id: &str) -> SystemJob {
        SystemJob::new(
            DELETE_FLOW_JOB,
            json!({ "flowId": flow_id, PRE_DELETE_DONE: false, DB_DELETE_DONE: false }),
            JobSchedule::one_time(Utc::now()),
        )
        .with_id(format!("{}-{}", DELETE_FLOW_JOB, flow_id))
    }
}

#[async_trait]
impl JobHandler for DeleteFlowJob {
    fn name(&self) -> &str {
        DELETE_FLOW_JOB
    }

    fn family(&self) -> JobFamily {
        JobFamily::Durable
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), AppError> {
        let flow_id = ctx
            .payload
            .get("flowId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::new(ErrorCategory::ValidationError, "delete-flow payload has no flowId")
                    .with_code("JOB-006")
            })?;

        let service = Arc::clone(&self.service);
        let mut progress = ctx.progress();
        progress
            .step(PRE_DELETE_DONE, || service.pre_delete(&flow_id))
            .await?;
        progress
            .step(DB_DELETE_DONE, || service.delete_from_db(&flow_id))
            .await?;
        tracing::info!(flow_id = %flow_id, "flow deleted");
        Ok(())
    }
}

/// Keeps the artifact cache bounded.
pub struct PruneArtifactCacheJob {
    cache: Arc<ArtifactCache>,
    max_entries: usize,
}

impl PruneArtifactCacheJob {
    pub const DEFAULT_CRON: &'static str = "*/15 * * * *";
    pub const DEFAULT_MAX_ENTRIES: usize = 256;

    pub fn new(cache: Arc<ArtifactCache>, max_entries: usize) -> Self {
        Self { cache, max_entries }
    }

    pub fn job(cron: &str) -> Result<SystemJob, ScheduleError> {
        Ok(SystemJob::new(
            PRUNE_ARTIFACT_CACHE_JOB,
            json!({}),
            JobSchedule::repeated(cron)?,
        ))
    }
}

#[async_trait]
impl JobHandler for PruneArtifactCacheJob {
    fn name(&self) -> &str {
        PRUNE_ARTIFACT_CACHE_JOB
    }

    async fn run(&self, _ctx: &mut JobContext) -> Result<(), AppError> {
        let removed = self.cache.prune(self.max_entries);
        if removed > 0 {
            tracing::info!(removed, remaining = self.cache.len(), "artifact cache pruned");
        }
        Ok(())
    }
}
