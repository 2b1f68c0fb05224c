#[path = "../support/mod.rs"]
mod support;

use async_trait::async_trait;
use flowrun::core::config::RuntimeConfig;
use flowrun::core::error::AppError;
use flowrun::core::flow::run_store;
use flowrun::core::flow::{
    ActionContext, FlowRunner, PieceAction, PieceKey, PieceRegistry, RunOptions, StepStatus,
};
use flowrun::core::types::{ErrorCategory, RunStatus};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use support::{flow, services};
use tempfile::TempDir;

/// Returns its props and remembers every call.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl PieceAction for Recorder {
    async fn run(&self, ctx: ActionContext) -> Result<Value, AppError> {
        self.calls.lock().unwrap().push(ctx.props_value.clone());
        Ok(json!({ "sent": ctx.props_value, "step": ctx.step_name }))
    }
}

/// Fails until it has been called `failures` times.
struct Flaky {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl PieceAction for Flaky {
    async fn run(&self, _ctx: ActionContext) -> Result<Value, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(AppError::new(
                ErrorCategory::StepExecutionError,
                format!("upstream 503 on call {}", call),
            ));
        }
        Ok(json!({ "calls": call }))
    }
}

fn registry(recorder: &Recorder, flaky: Option<Flaky>) -> PieceRegistry {
    let mut builder = PieceRegistry::builder();
    builder
        .register(PieceKey::new("slack", "0.5.0", "send_message"), recorder.clone())
        .unwrap();
    if let Some(flaky) = flaky {
        builder
            .register(PieceKey::new("http", "1.0.0", "get"), flaky)
            .unwrap();
    }
    builder.build()
}

fn runner(workspace: &TempDir, pieces: PieceRegistry) -> (FlowRunner, Arc<support::ScriptedBackend>) {
    let (services, backend) = services(workspace.path(), RuntimeConfig::default(), pieces, 2);
    (FlowRunner::new(services), backend)
}

const LINEAR_FLOW: &str = r#"
id: linear
configs:
  channel: ops
trigger:
  name: trigger
  type: TRIGGER
  next:
    name: double
    type: CODE
    settings:
      source:
        code: "exports.code = async (i) => i.n * 2 // double"
      input:
        n: "${trigger.n}"
    next:
      name: notify
      type: PIECE
      settings:
        piece_name: slack
        piece_version: "0.5.0"
        action_name: send_message
        input:
          channel: "${configs.channel}"
          text: "doubled ${trigger.n} to ${double}"
"#;

#[tokio::test]
async fn linear_flow_threads_outputs_between_steps() {
    let workspace = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let (runner, _) = runner(&workspace, registry(&recorder, None));

    let result = runner
        .run(&flow(LINEAR_FLOW), json!({"n": 21}), RunOptions::default())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert!(result.failure.is_none());
    assert_eq!(result.flow_id, "linear");
    assert_eq!(result.flow_version, "1");
    let names: Vec<&str> = result.state.steps().keys().map(String::as_str).collect();
    assert_eq!(names, vec!["trigger", "double", "notify"]);
    assert_eq!(result.state.record("double").unwrap().output, json!(42));
    assert_eq!(
        recorder.calls.lock().unwrap().as_slice(),
        &[json!({"channel": "ops", "text": "doubled 21 to 42"})]
    );
    assert_eq!(
        result.state.record("notify").unwrap().output["step"],
        json!("notify")
    );
}

#[tokio::test]
async fn config_overrides_win_over_flow_configs() {
    let workspace = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let (runner, _) = runner(&workspace, registry(&recorder, None));

    let mut overrides = Map::new();
    overrides.insert("channel".to_string(), json!("alerts"));
    let options = RunOptions {
        config_overrides: overrides,
        ..RunOptions::default()
    };
    let result = runner.run(&flow(LINEAR_FLOW), json!({"n": 1}), options).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(recorder.calls.lock().unwrap()[0]["channel"], json!("alerts"));
}

#[tokio::test]
async fn built_artifacts_are_reused_across_runs() {
    let workspace = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let (runner, backend) = runner(&workspace, registry(&recorder, None));
    let flow = flow(LINEAR_FLOW);

    for n in [1, 2, 3] {
        let result = runner.run(&flow, json!({"n": n}), RunOptions::default()).await;
        assert_eq!(result.state.record("double").unwrap().output, json!(n * 2));
    }
    assert_eq!(backend.builds.load(Ordering::SeqCst), 1);
    assert_eq!(backend.count(support::RUNTIME), 3);
    assert_eq!(runner.services().code.cache().len(), 1);
    assert_eq!(runner.services().pool.available(), 2);
}

const BRANCH_FLOW: &str = r#"
id: orders
configs:
  threshold: 10
trigger:
  name: trigger
  type: TRIGGER
  next:
    name: check
    type: BRANCH
    settings:
      conditions:
        - - first_value: "${trigger.amount}"
            operator: number_is_greater_than
            second_value: "${configs.threshold}"
    on_true:
      name: big
      type: PIECE
      settings:
        piece_name: slack
        piece_version: "0.5.0"
        action_name: send_message
        input:
          text: "big order ${trigger.amount}"
    on_false:
      name: small
      type: CODE
      settings:
        source:
          code: "module.exports.code = async (i) => i // echo"
        input:
          amount: "${trigger.amount}"
    next:
      name: done
      type: CODE
      settings:
        source:
          code: "exports.code = async (i) => i // echo"
        input:
          big: "${big.sent.text}"
          small: "${small.amount}"
"#;

#[tokio::test]
async fn branch_takes_the_matching_edge_then_rejoins() {
    let workspace = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let (runner, _) = runner(&workspace, registry(&recorder, None));
    let flow = flow(BRANCH_FLOW);

    let big = runner.run(&flow, json!({"amount": 50}), RunOptions::default()).await;
    assert_eq!(big.status, RunStatus::Succeeded);
    assert_eq!(big.state.record("check").unwrap().output, json!({"condition": true}));
    assert!(big.state.record("small").is_none());
    assert_eq!(
        big.state.record("done").unwrap().output,
        json!({"big": "big order 50", "small": null})
    );

    let small = runner.run(&flow, json!({"amount": 3}), RunOptions::default()).await;
    assert_eq!(small.status, RunStatus::Succeeded);
    assert_eq!(small.state.record("check").unwrap().output, json!({"condition": false}));
    assert!(small.state.record("big").is_none());
    assert_eq!(
        small.state.record("done").unwrap().output,
        json!({"big": null, "small": 3})
    );
    assert_eq!(recorder.calls.lock().unwrap().len(), 1);
}

const LOOP_FLOW: &str = r#"
id: lines
trigger:
  name: trigger
  type: TRIGGER
  next:
    name: each_line
    type: LOOP_ON_ITEMS
    settings:
      items: "${trigger.lines}"
    body:
      name: total
      type: CODE
      settings:
        source:
          code: "exports.code = async (i) => i.n * 2 // double"
        input:
          n: "${each_line.item.qty}"
      next:
        name: label
        type: CODE
        settings:
          source:
            code: "exports.code = async (i) => i // echo"
          input:
            index: "${each_line.index}"
            total: "${total}"
    next:
      name: summary
      type: CODE
      settings:
        source:
          code: "exports.code = async (i) => i // echo"
        input:
          iterations: "${each_line}"
          leaked: "${total}"
"#;

#[tokio::test]
async fn loop_collects_one_object_per_iteration() {
    let workspace = TempDir::new().unwrap();
    let (runner, _) = runner(&workspace, PieceRegistry::default());

    let result = runner
        .run(
            &flow(LOOP_FLOW),
            json!({"lines": [{"qty": 1}, {"qty": 4}]}),
            RunOptions::default(),
        )
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let expected = json!([
        {"total": 2, "label": {"index": 0, "total": 2}},
        {"total": 8, "label": {"index": 1, "total": 8}}
    ]);
    assert_eq!(result.state.record("each_line").unwrap().output, expected);
    assert!(result.state.record("total").is_none());
    assert_eq!(
        result.state.record("summary").unwrap().output,
        json!({"iterations": expected, "leaked": null})
    );
}

#[tokio::test]
async fn empty_loop_produces_empty_array() {
    let workspace = TempDir::new().unwrap();
    let (runner, backend) = runner(&workspace, PieceRegistry::default());

    let result = runner
        .run(&flow(LOOP_FLOW), json!({"lines": []}), RunOptions::default())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.state.record("each_line").unwrap().output, json!([]));
    assert_eq!(backend.count(support::RUNTIME), 1);
}

#[tokio::test]
async fn loop_over_non_array_fails_the_run() {
    let workspace = TempDir::new().unwrap();
    let (runner, _) = runner(&workspace, PieceRegistry::default());

    let result = runner
        .run(&flow(LOOP_FLOW), json!({"lines": "nope"}), RunOptions::default())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.step, "each_line");
    assert_eq!(failure.code, "FLW-LOOP-001");
    assert!(failure.message.contains("a string"));
    assert_eq!(result.state.record("each_line").unwrap().status, StepStatus::Failed);
    assert!(result.state.record("summary").is_none());
}

const FAILING_FLOW: &str = r#"
id: failing
trigger:
  name: trigger
  type: TRIGGER
  next:
    name: explode
    type: CODE
    settings:
      source:
        code: "exports.code = async () => Promise.reject(new Error('boom')) // throw"
    next:
      name: after
      type: CODE
      settings:
        source:
          code: "exports.code = async (i) => i // echo"
"#;

#[tokio::test]
async fn thrown_error_stops_the_run() {
    let workspace = TempDir::new().unwrap();
    let (runner, backend) = runner(&workspace, PieceRegistry::default());

    let result = runner
        .run(&flow(FAILING_FLOW), json!({}), RunOptions::default())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.step, "explode");
    assert_eq!(failure.code, "FLW-CODE-002");
    assert_eq!(failure.message, "boom");
    let explode = result.state.record("explode").unwrap();
    assert_eq!(explode.status, StepStatus::Failed);
    assert_eq!(explode.error.as_deref(), Some("boom"));
    assert!(result.state.record("after").is_none());
    assert_eq!(backend.count(support::RUNTIME), 1);
}

#[tokio::test]
async fn continue_on_failure_records_and_moves_on() {
    let workspace = TempDir::new().unwrap();
    let (runner, _) = runner(&workspace, PieceRegistry::default());
    let yaml = FAILING_FLOW.replace(
        "    name: explode\n",
        "    name: explode\n    error_handling:\n      continue_on_failure: true\n",
    );

    let result = runner.run(&flow(&yaml), json!({}), RunOptions::default()).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let explode = result.state.record("explode").unwrap();
    assert_eq!(explode.status, StepStatus::Failed);
    assert_eq!(explode.output, Value::Null);
    assert!(result.state.record("after").is_some());
}

const CRASHING_FLOW: &str = r#"
id: crashing
trigger:
  name: trigger
  type: TRIGGER
  next:
    name: segv
    type: CODE
    settings:
      source:
        code: "process.kill(process.pid, 'SIGSEGV') // crash"
"#;

#[tokio::test]
async fn missing_output_reports_stderr() {
    let workspace = TempDir::new().unwrap();
    let (runner, _) = runner(&workspace, PieceRegistry::default());

    let result = runner
        .run(&flow(CRASHING_FLOW), json!({}), RunOptions::default())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.code, "FLW-CODE-003");
    assert!(failure.message.contains("exit code Some(139)"));
    assert_eq!(failure.stderr.as_deref(), Some("Segmentation fault (core dumped)"));
}

#[tokio::test]
async fn failed_build_runs_fallback_and_is_not_cached() {
    let workspace = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let (runner, backend) = runner(&workspace, registry(&recorder, None));
    backend.fail_build.store(true, Ordering::SeqCst);
    let flow = flow(LINEAR_FLOW);

    let result = runner.run(&flow, json!({"n": 2}), RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.step, "double");
    assert_eq!(failure.code, "FLW-CODE-002");
    assert!(failure.message.starts_with("Failed to build code step:"));
    assert!(failure.message.contains("Module parse failed"));
    assert!(recorder.calls.lock().unwrap().is_empty());
    assert!(runner.services().code.cache().is_empty());

    backend.fail_build.store(false, Ordering::SeqCst);
    let result = runner.run(&flow, json!({"n": 2}), RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(backend.builds.load(Ordering::SeqCst), 2);
}

const RETRY_FLOW: &str = r#"
id: retrying
trigger:
  name: trigger
  type: TRIGGER
  next:
    name: fetch
    type: PIECE
    error_handling:
      retry:
        max_attempts: 3
        delay_ms: 5
        backoff_multiplier: 2.0
    settings:
      piece_name: http
      piece_version: "1.0.0"
      action_name: get
"#;

#[tokio::test]
async fn retry_policy_reruns_failed_attempts() {
    let workspace = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = Flaky {
        failures: 2,
        calls: Arc::clone(&calls),
    };
    let (runner, _) = runner(&workspace, registry(&Recorder::default(), Some(flaky)));

    let result = runner.run(&flow(RETRY_FLOW), json!({}), RunOptions::default()).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.state.record("fetch").unwrap().output, json!({"calls": 3}));
}

#[tokio::test]
async fn exhausted_retries_fail_with_last_error() {
    let workspace = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = Flaky {
        failures: 10,
        calls: Arc::clone(&calls),
    };
    let (runner, _) = runner(&workspace, registry(&Recorder::default(), Some(flaky)));

    let result = runner.run(&flow(RETRY_FLOW), json!({}), RunOptions::default()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let failure = result.failure.unwrap();
    assert_eq!(failure.code, "FLW-PIECE-002");
    assert!(failure.message.contains("upstream 503 on call 3"));
}

#[tokio::test]
async fn unregistered_piece_fails_the_step() {
    let workspace = TempDir::new().unwrap();
    let (runner, _) = runner(&workspace, PieceRegistry::default());

    let result = runner.run(&flow(RETRY_FLOW), json!({}), RunOptions::default()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failure.unwrap().code, "FLW-PIECE-001");
}

#[tokio::test]
async fn persisted_runs_are_redacted_on_disk() {
    let workspace = TempDir::new().unwrap();
    let mut config = RuntimeConfig::default();
    config.run.persist_runs = true;
    let (services, _) = services(workspace.path(), config, PieceRegistry::default(), 1);
    let runner = FlowRunner::new(services);
    let options = RunOptions {
        run_id: Some("run-42".to_string()),
        ..RunOptions::default()
    };

    let yaml = r#"
id: secrets
trigger:
  name: trigger
  type: TRIGGER
  next:
    name: echo
    type: CODE
    settings:
      source:
        code: "exports.code = async (i) => i // echo"
      input:
        password: "${trigger.password}"
        user: "${trigger.user}"
"#;
    let result = runner
        .run(&flow(yaml), json!({"user": "ada", "password": "hunter2"}), options)
        .await;
    assert_eq!(result.run_id, "run-42");
    assert_eq!(result.state.record("echo").unwrap().output["password"], json!("hunter2"));

    let stored = run_store::load_run(workspace.path(), "run-42").unwrap();
    assert_eq!(stored["status"], json!("Succeeded"));
    let steps = &stored["state"]["steps"];
    assert_eq!(steps["trigger"]["output"]["password"], json!("[REDACTED]"));
    assert_eq!(steps["echo"]["output"]["password"], json!("[REDACTED]"));
    assert_eq!(steps["echo"]["output"]["user"], json!("ada"));
}
