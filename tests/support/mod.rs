//! Scripted sandbox backend for exercising the runtime without node or isolate.
//!
//! Boxes are real directories under a temp root. Commands are interpreted:
//! the install and build commands emulate npm, and the runtime command reads
//! `index.js` and `input.json` and writes `output.json` the way the runner
//! script does. Code is "executed" by matching marker comments in the source.
#![allow(dead_code)]

use async_trait::async_trait;
use flowrun::core::config::RuntimeConfig;
use flowrun::core::error::AppError;
use flowrun::core::flow::{parse_flow, FlowVersion, PieceRegistry, RuntimeServices};
use flowrun::core::sandbox::{
    SandboxBackend, SandboxCommand, SandboxLimits, SandboxOutcome, SandboxPool, SandboxStatus,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INSTALL: &str = "npm install --no-audit --no-fund --ignore-scripts";
pub const BUILD: &str = "npm run build";
pub const RUNTIME: &str = "node run.js";

const FALLBACK_PREFIX: &str = "exports.code = async () => { throw new Error(";

#[derive(Default)]
pub struct ScriptedBackend {
    base: PathBuf,
    pub commands: Mutex<Vec<String>>,
    pub inits: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub builds: AtomicUsize,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub fail_install: AtomicBool,
    pub fail_build: AtomicBool,
    run_delay: Mutex<Option<Duration>>,
}

impl ScriptedBackend {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = Some(delay);
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    fn ok(stdout: &str) -> SandboxOutcome {
        SandboxOutcome {
            exit_code: Some(0),
            status: SandboxStatus::Ok,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 1,
            max_rss_kb: None,
        }
    }

    fn failed(exit_code: i32, stderr: &str) -> SandboxOutcome {
        SandboxOutcome {
            exit_code: Some(exit_code),
            status: SandboxStatus::RuntimeError,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: 1,
            max_rss_kb: None,
        }
    }

    async fn run_code(&self, dir: &Path) -> SandboxOutcome {
        let delay = *self.run_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let source = std::fs::read_to_string(dir.join("index.js")).unwrap_or_default();
        let input: Value = std::fs::read_to_string(dir.join("input.json"))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(Value::Null);

        if source.contains("// crash") {
            return Self::failed(139, "Segmentation fault (core dumped)");
        }
        let result = match evaluate(&source, &input) {
            Ok(output) => json!({ "status": "OK", "output": output }),
            Err(message) => json!({ "status": "ERROR", "error": { "message": message, "stack": null } }),
        };
        std::fs::write(dir.join("output.json"), result.to_string()).unwrap();
        Self::ok("")
    }
}

/// Marker-driven stand-in for running `exports.code(input)`.
pub fn evaluate(source: &str, input: &Value) -> Result<Value, String> {
    if let Some(rest) = source.strip_prefix(FALLBACK_PREFIX) {
        let literal = rest.trim_end().trim_end_matches("); };");
        return Err(serde_json::from_str::<String>(literal).unwrap_or_else(|_| literal.to_string()));
    }
    if source.contains("// throw") {
        return Err("boom".to_string());
    }
    if source.contains("// double") {
        let n = input.get("n").and_then(Value::as_i64).unwrap_or(0);
        return Ok(json!(n * 2));
    }
    if source.contains("// sum") {
        let total: i64 = input
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).sum())
            .unwrap_or(0);
        return Ok(json!({ "total": total }));
    }
    if source.contains("// undefined") {
        return Ok(Value::Null);
    }
    Ok(input.clone())
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn init(&self, box_id: usize) -> Result<PathBuf, AppError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let dir = self.scratch_dir(box_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn cleanup(&self, box_id: usize) -> Result<(), AppError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        let _ = std::fs::remove_dir_all(self.scratch_dir(box_id));
        Ok(())
    }

    async fn run(
        &self,
        box_id: usize,
        command: &SandboxCommand,
    ) -> Result<SandboxOutcome, AppError> {
        self.commands.lock().unwrap().push(command.command.clone());
        let dir = self.scratch_dir(box_id);
        match command.command.as_str() {
            INSTALL => {
                if self.fail_install.load(Ordering::SeqCst) {
                    Ok(Self::failed(1, "npm ERR! 404 Not Found - left-pad-9000"))
                } else {
                    Ok(Self::ok("added 2 packages"))
                }
            }
            BUILD => {
                self.builds.fetch_add(1, Ordering::SeqCst);
                if self.fail_build.load(Ordering::SeqCst) {
                    return Ok(Self::failed(2, "ERROR in ./index.js\nModule parse failed"));
                }
                std::fs::create_dir_all(dir.join("dist"))?;
                std::fs::copy(dir.join("index.js"), dir.join("dist/index.js"))?;
                Ok(Self::ok("webpack compiled successfully"))
            }
            RUNTIME => {
                self.started.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
                let guard = InFlight(&self.in_flight);
                let result = self.run_code(&dir).await;
                drop(guard);
                self.finished.fetch_add(1, Ordering::SeqCst);
                Ok(result)
            }
            other => Ok(Self::failed(127, &format!("{}: command not found", other))),
        }
    }

    fn scratch_dir(&self, box_id: usize) -> PathBuf {
        self.base.join(format!("box-{}", box_id))
    }
}

/// Decrements the in-flight counter even when the run future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn pool(backend: &Arc<ScriptedBackend>, size: usize) -> SandboxPool {
    SandboxPool::new(
        Arc::clone(backend) as Arc<dyn SandboxBackend>,
        size,
        SandboxLimits::default(),
    )
    .unwrap()
}

/// Services backed by a scripted pool rooted in `workspace`.
pub fn services(
    workspace: &Path,
    config: RuntimeConfig,
    pieces: PieceRegistry,
    pool_size: usize,
) -> (RuntimeServices, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new(&workspace.join("boxes")));
    let pool = pool(&backend, pool_size);
    (RuntimeServices::new(workspace, config, pool, pieces), backend)
}

pub fn flow(yaml: &str) -> FlowVersion {
    parse_flow(yaml, false).unwrap()
}
