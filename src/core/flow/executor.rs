#![allow(clippy::result_large_err)] // Runtime construction returns AppError to keep structured context without boxing.

use crate::core::builder::{ArtifactCache, CodeBuilder};
use crate::core::config::RuntimeConfig;
use crate::core::error::AppError;
use crate::core::flow::code::CodeStepRunner;
use crate::core::flow::piece::{
    run_piece_step, ActionContext, FileWriter, InMemoryStore, KeyValueStore, LocalFileWriter,
    PieceRegistry, RunFiles, ScopedStore,
};
use crate::core::flow::resolver::resolve;
use crate::core::flow::run_store;
use crate::core::flow::schema::{FlowVersion, StepKind, StepNode};
use crate::core::flow::state::{ExecutionState, StepError, StepRecord};
use crate::core::sandbox::SandboxPool;
use crate::core::types::{ErrorCategory, RunStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared collaborators for every run in the process.
pub struct RuntimeServices {
    pub workspace: PathBuf,
    pub config: RuntimeConfig,
    pub pool: SandboxPool,
    pub code: Arc<CodeStepRunner>,
    pub pieces: PieceRegistry,
    pub store: Arc<dyn KeyValueStore>,
    pub files: Arc<dyn FileWriter>,
}

impl RuntimeServices {
    /// Wire services around an existing pool.
    pub fn new(
        workspace: &Path,
        config: RuntimeConfig,
        pool: SandboxPool,
        pieces: PieceRegistry,
    ) -> Self {
        let cache_dir = config
            .builder
            .cache_dir
            .as_ref()
            .map(|dir| if dir.is_absolute() { dir.clone() } else { workspace.join(dir) });
        let builder = CodeBuilder::new(pool.clone(), config.builder.clone());
        let code = CodeStepRunner::new(
            pool.clone(),
            builder,
            Arc::new(ArtifactCache::new(cache_dir)),
            config.code.clone(),
        );
        RuntimeServices {
            workspace: workspace.to_path_buf(),
            pool,
            code: Arc::new(code),
            pieces,
            store: Arc::new(InMemoryStore::new()),
            files: Arc::new(LocalFileWriter::for_workspace(workspace)),
            config,
        }
    }

    /// Build the sandbox pool described by `config` and wire services around it.
    pub fn from_config(
        workspace: &Path,
        config: RuntimeConfig,
        pieces: PieceRegistry,
    ) -> Result<Self, AppError> {
        let pool = SandboxPool::from_config(&config.sandbox, workspace)?;
        Ok(Self::new(workspace, config, pool, pieces))
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FileWriter>) -> Self {
        self.files = files;
        self
    }
}

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancel: CancellationToken,
    /// Whole-run budget; defaults to `run.max_time_seconds`.
    pub max_time: Option<Duration>,
    pub run_id: Option<String>,
    /// Merged over the flow's own configs.
    pub config_overrides: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub flow_id: String,
    pub flow_version: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Handle to a run executing on its own task.
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation; in-flight sandbox work is killed and its box released.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<RunResult, AppError> {
        self.join.await.map_err(|err| {
            AppError::new(
                ErrorCategory::InternalError,
                format!("run {} task failed: {}", self.run_id, err),
            )
            .with_code("FLW-RUN-001")
        })
    }
}

/// Why a walk stopped early.
#[derive(Debug)]
enum Halt {
    Failed(RunFailure),
    Cancelled { step: String },
    TimedOut { step: String },
}

impl Halt {
    fn describe(&self) -> String {
        match self {
            Halt::Failed(failure) => failure.message.clone(),
            Halt::Cancelled { .. } => "run cancelled".to_string(),
            Halt::TimedOut { .. } => "run exceeded its time limit".to_string(),
        }
    }
}

/// Interprets flow graphs. Cheap to clone; runs share the services.
#[derive(Clone)]
pub struct FlowRunner {
    services: Arc<RuntimeServices>,
}

impl FlowRunner {
    pub fn new(services: RuntimeServices) -> Self {
        Self {
            services: Arc::new(services),
        }
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    /// Run a flow to completion on a separate task.
    pub fn spawn(
        &self,
        flow: Arc<FlowVersion>,
        trigger_payload: Value,
        mut options: RunOptions,
    ) -> RunHandle {
        let run_id = options
            .run_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let cancel = options.cancel.clone();
        let runner = self.clone();
        let join =
            tokio::spawn(async move { runner.run(&flow, trigger_payload, options).await });
        RunHandle {
            run_id,
            cancel,
            join,
        }
    }

    pub async fn run(
        &self,
        flow: &FlowVersion,
        trigger_payload: Value,
        options: RunOptions,
    ) -> RunResult {
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let max_time = options
            .max_time
            .unwrap_or_else(|| self.services.config.run.max_time());
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut configs = flow.configs.clone();
        configs.extend(options.config_overrides);
        let mut state = ExecutionState::new(configs);

        let trigger = flow.trigger();
        tracing::info!(run_id = %run_id, flow_id = %flow.id, version = %flow.version, "flow run started");

        let walker = Walker {
            services: &self.services,
            flow,
            run_id: &run_id,
            cancel: &options.cancel,
            deadline: clock + max_time,
        };
        let outcome = match state.bind_trigger(&trigger.name, trigger_payload) {
            Ok(()) => walker.walk_chain(trigger.next, &mut state).await,
            Err(err) => Err(Halt::Failed(RunFailure {
                step: trigger.name.clone(),
                code: err.code.clone(),
                message: err.message.clone(),
                stderr: None,
            })),
        };

        let (status, failure) = match outcome {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(Halt::Failed(failure)) => (RunStatus::Failed, Some(failure)),
            Err(Halt::Cancelled { step }) => {
                tracing::info!(run_id = %run_id, step = %step, "flow run cancelled");
                (RunStatus::Cancelled, None)
            }
            Err(Halt::TimedOut { step }) => (
                RunStatus::TimedOut,
                Some(RunFailure {
                    step,
                    code: "FLW-RUN-002".to_string(),
                    message: format!("run exceeded max time of {}", humantime::format_duration(max_time)),
                    stderr: None,
                }),
            ),
        };

        let result = RunResult {
            run_id,
            flow_id: flow.id.clone(),
            flow_version: flow.version.clone(),
            status,
            failure,
            state,
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        match &result.failure {
            Some(failure) => tracing::warn!(
                run_id = %result.run_id,
                status = %result.status,
                step = %failure.step,
                code = %failure.code,
                "flow run finished: {}",
                failure.message
            ),
            None => tracing::info!(
                run_id = %result.run_id,
                status = %result.status,
                duration_ms = result.duration_ms,
                "flow run finished"
            ),
        }

        if self.services.config.run.persist_runs {
            if let Err(err) = run_store::save_run(
                &self.services.workspace,
                &result,
                &self.services.config.run.redact_keys,
            ) {
                tracing::error!(run_id = %result.run_id, error = %err, "failed to persist run");
            }
        }
        result
    }
}

struct Walker<'a> {
    services: &'a RuntimeServices,
    flow: &'a FlowVersion,
    run_id: &'a str,
    cancel: &'a CancellationToken,
    deadline: Instant,
}

impl<'a> Walker<'a> {
    fn walk_chain<'s>(
        &'s self,
        start: Option<usize>,
        state: &'s mut ExecutionState,
    ) -> BoxFuture<'s, Result<(), Halt>> {
        Box::pin(async move {
            let mut cursor = start;
            while let Some(id) = cursor {
                let node = self.flow.step(id);
                self.check_interrupt(&node.name)?;
                self.run_step(node, state).await?;
                cursor = node.next;
            }
            Ok(())
        })
    }

    fn check_interrupt(&self, step: &str) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled {
                step: step.to_string(),
            });
        }
        if Instant::now() >= self.deadline {
            return Err(Halt::TimedOut {
                step: step.to_string(),
            });
        }
        Ok(())
    }

    /// Race `fut` against cancellation and the run deadline. Losing drops `fut`.
    async fn guarded<F: Future>(&self, step: &str, fut: F) -> Result<F::Output, Halt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled { step: step.to_string() }),
            _ = tokio::time::sleep_until(self.deadline) => Err(Halt::TimedOut { step: step.to_string() }),
            output = fut => Ok(output),
        }
    }

    async fn run_step(&self, node: &StepNode, state: &mut ExecutionState) -> Result<(), Halt> {
        let started = Instant::now();
        match &node.kind {
            StepKind::Trigger => Err(self.record_failure(
                node,
                state,
                StepError::new("FLW-WALK-001", "trigger steps cannot be executed"),
                started,
            )),
            StepKind::Branch {
                settings,
                on_true,
                on_false,
            } => {
                let taken = settings.evaluate(state);
                tracing::debug!(run_id = self.run_id, step = %node.name, taken, "branch evaluated");
                self.record(
                    state,
                    StepRecord::success(&node.name, serde_json::json!({ "condition": taken }), elapsed(started)),
                )?;
                let edge = if taken { *on_true } else { *on_false };
                self.walk_chain(edge, state).await
            }
            StepKind::LoopOnItems { settings, body } => {
                let items = match resolve(&settings.items, state) {
                    Value::Array(items) => items,
                    other => {
                        let err = StepError::new(
                            "FLW-LOOP-001",
                            format!("loop items resolved to {} instead of an array", json_type(&other)),
                        );
                        return Err(self.record_failure(node, state, err, started));
                    }
                };
                let mut iterations = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    if let Err(halt) = self.check_interrupt(&node.name) {
                        return Err(self.close_loop(node, state, iterations, halt, started));
                    }
                    state.push_frame(&node.name, item, index);
                    let walked = self.walk_chain(*body, state).await;
                    iterations.push(state.pop_frame().unwrap_or(Value::Null));
                    if let Err(halt) = walked {
                        return Err(self.close_loop(node, state, iterations, halt, started));
                    }
                }
                self.record(
                    state,
                    StepRecord::success(&node.name, Value::Array(iterations), elapsed(started)),
                )
            }
            StepKind::Code(_) | StepKind::Piece(_) => self.run_leaf(node, state, started).await,
        }
    }

    /// CODE and PIECE steps, with the step's retry and continue-on-failure policy.
    async fn run_leaf(
        &self,
        node: &StepNode,
        state: &mut ExecutionState,
        started: Instant,
    ) -> Result<(), Halt> {
        let policy = &node.error_handling;
        let max_attempts = policy.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1);
        let mut attempt: u32 = 0;

        loop {
            let result = self.guarded(&node.name, self.invoke(node, state)).await?;
            attempt += 1;
            let err = match result {
                Ok(output) => {
                    return self.record(state, StepRecord::success(&node.name, output, elapsed(started)));
                }
                Err(err) => err,
            };

            if let Some(retry) = policy.retry.as_ref().filter(|_| (attempt as usize) < max_attempts) {
                let jitter = retry
                    .jitter_ms
                    .filter(|j| *j > 0)
                    .map(|j| rand::thread_rng().gen_range(0..=j))
                    .unwrap_or(0);
                let delay = retry.delay_for(attempt - 1) + Duration::from_millis(jitter);
                tracing::warn!(
                    run_id = self.run_id,
                    step = %node.name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "step failed, retrying: {}",
                    err
                );
                self.guarded(&node.name, tokio::time::sleep(delay)).await?;
                continue;
            }

            if policy.continue_on_failure {
                tracing::warn!(run_id = self.run_id, step = %node.name, "step failed, continuing: {}", err);
                return self.record(
                    state,
                    StepRecord::failed(&node.name, Value::Null, err.message, elapsed(started)),
                );
            }
            return Err(self.record_failure(node, state, err, started));
        }
    }

    async fn invoke(&self, node: &StepNode, state: &ExecutionState) -> Result<Value, StepError> {
        match &node.kind {
            StepKind::Code(settings) => {
                let input = resolve(&settings.input, state);
                let source = settings.source.load(&self.services.workspace).await?;
                let artifact_id = settings.artifact_id.as_deref().unwrap_or(node.name.as_str());
                self.services.code.execute(artifact_id, &source, &input).await
            }
            StepKind::Piece(settings) => {
                let ctx = ActionContext {
                    auth: resolve(&settings.auth, state),
                    props_value: resolve(&settings.input, state),
                    store: ScopedStore::new(
                        Arc::clone(&self.services.store),
                        &self.flow.id,
                        &settings.piece_name,
                    ),
                    files: RunFiles::new(Arc::clone(&self.services.files), self.run_id),
                    run_id: self.run_id.to_string(),
                    flow_id: self.flow.id.clone(),
                    step_name: node.name.clone(),
                };
                run_piece_step(&self.services.pieces, settings, ctx).await
            }
            other => Err(StepError::new(
                "FLW-WALK-001",
                format!("{} is not a leaf step", other.type_name()),
            )),
        }
    }

    fn record(&self, state: &mut ExecutionState, record: StepRecord) -> Result<(), Halt> {
        let name = record.name.clone();
        state.insert(record).map_err(|err| {
            Halt::Failed(RunFailure {
                step: name,
                code: err.code,
                message: err.message,
                stderr: None,
            })
        })
    }

    fn record_failure(
        &self,
        node: &StepNode,
        state: &mut ExecutionState,
        err: StepError,
        started: Instant,
    ) -> Halt {
        tracing::error!(run_id = self.run_id, step = %node.name, code = %err.code, "step failed: {}", err.message);
        let record = StepRecord::failed(&node.name, Value::Null, err.message.clone(), elapsed(started));
        if let Err(halt) = self.record(state, record) {
            return halt;
        }
        Halt::Failed(RunFailure {
            step: node.name.clone(),
            code: err.code,
            message: err.message,
            stderr: err.stderr,
        })
    }

    /// Keep the iterations that finished so the partial state shows them.
    fn close_loop(
        &self,
        node: &StepNode,
        state: &mut ExecutionState,
        iterations: Vec<Value>,
        halt: Halt,
        started: Instant,
    ) -> Halt {
        let record = StepRecord::failed(
            &node.name,
            Value::Array(iterations),
            halt.describe(),
            elapsed(started),
        );
        match self.record(state, record) {
            Ok(()) => halt,
            Err(record_halt) => record_halt,
        }
    }
}

fn elapsed(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
