#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::flow::schema::TRIGGER_ROOT;
use crate::core::types::ErrorCategory;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Output of one executed step, written once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub output: Value,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn success(name: impl Into<String>, output: Value, duration_ms: u64) -> Self {
        StepRecord {
            name: name.into(),
            output,
            status: StepStatus::Success,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(
        name: impl Into<String>,
        output: Value,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        StepRecord {
            name: name.into(),
            output,
            status: StepStatus::Failed,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Failure produced by a step handler. It is a value, not a panic, so the
/// walker can apply retry and continue-on-failure policies to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        StepError {
            code: code.into(),
            message: message.into(),
            stderr: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        if !stderr.is_empty() {
            self.stderr = Some(stderr);
        }
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<AppError> for StepError {
    fn from(err: AppError) -> Self {
        StepError::new(err.code, err.message)
    }
}

#[derive(Debug, Clone)]
struct IterationFrame {
    loop_name: String,
    binding: Value,
    steps: IndexMap<String, StepRecord>,
}

/// Bindings visible to placeholder resolution during one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    configs: Value,
    steps: IndexMap<String, StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trigger_step: Option<String>,
    #[serde(skip)]
    frames: Vec<IterationFrame>,
}

impl ExecutionState {
    pub fn new(configs: Map<String, Value>) -> Self {
        ExecutionState {
            configs: Value::Object(configs),
            ..Default::default()
        }
    }

    pub fn configs(&self) -> &Value {
        &self.configs
    }

    /// Record the trigger payload as the output of the root step.
    pub fn bind_trigger(&mut self, step_name: &str, payload: Value) -> Result<(), AppError> {
        self.insert(StepRecord::success(step_name, payload, 0))?;
        self.trigger_step = Some(step_name.to_string());
        Ok(())
    }

    /// Append a step record into the innermost scope.
    pub fn insert(&mut self, record: StepRecord) -> Result<(), AppError> {
        if self.is_visible(&record.name) {
            return Err(AppError::new(
                ErrorCategory::StepExecutionError,
                format!("step '{}' already has an output in this run", record.name),
            )
            .with_code("FLW-STATE-001"));
        }
        let scope = match self.frames.last_mut() {
            Some(frame) => &mut frame.steps,
            None => &mut self.steps,
        };
        scope.insert(record.name.clone(), record);
        Ok(())
    }

    fn is_visible(&self, name: &str) -> bool {
        self.steps.contains_key(name)
            || self
                .frames
                .iter()
                .any(|frame| frame.loop_name == name || frame.steps.contains_key(name))
    }

    /// Resolve a placeholder root to its value, innermost scope first.
    pub fn lookup(&self, root: &str) -> Option<&Value> {
        if root == "configs" {
            return Some(&self.configs);
        }
        if root == TRIGGER_ROOT {
            if let Some(trigger) = self.trigger_step.as_deref() {
                return self.record(trigger).map(|record| &record.output);
            }
        }
        for frame in self.frames.iter().rev() {
            if frame.loop_name == root {
                return Some(&frame.binding);
            }
            if let Some(record) = frame.steps.get(root) {
                return Some(&record.output);
            }
        }
        self.steps.get(root).map(|record| &record.output)
    }

    pub fn record(&self, name: &str) -> Option<&StepRecord> {
        for frame in self.frames.iter().rev() {
            if let Some(record) = frame.steps.get(name) {
                return Some(record);
            }
        }
        self.steps.get(name)
    }

    /// Records in the outermost scope, in execution order.
    pub fn steps(&self) -> &IndexMap<String, StepRecord> {
        &self.steps
    }

    pub fn push_frame(&mut self, loop_name: &str, item: Value, index: usize) {
        self.frames.push(IterationFrame {
            loop_name: loop_name.to_string(),
            binding: json!({ "item": item, "index": index }),
            steps: IndexMap::new(),
        });
    }

    /// Close the innermost iteration and return its `{step: output}` object.
    pub fn pop_frame(&mut self) -> Option<Value> {
        self.frames.pop().map(|frame| {
            let outputs: Map<String, Value> = frame
                .steps
                .into_iter()
                .map(|(name, record)| (name, record.output))
                .collect();
            Value::Object(outputs)
        })
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Stable digest of the visible state, used to tag resolutions in logs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.configs.to_string().as_bytes());
        for record in self.steps.values() {
            hasher.update(record.name.as_bytes());
            hasher.update(record.output.to_string().as_bytes());
        }
        for frame in &self.frames {
            hasher.update(frame.binding.to_string().as_bytes());
            for record in frame.steps.values() {
                hasher.update(record.name.as_bytes());
                hasher.update(record.output.to_string().as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Replace values of secret-looking keys with a marker, recursively.
pub fn redact_value(value: &mut Value, redact_keys: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if should_redact(key, redact_keys) {
                    *child = Value::String("[REDACTED]".to_string());
                    continue;
                }
                redact_value(child, redact_keys);
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, redact_keys);
            }
        }
        _ => {}
    }
}

fn should_redact(key: &str, redact_keys: &[String]) -> bool {
    let key_lower = key.to_lowercase();
    redact_keys
        .iter()
        .any(|pattern| key_lower.contains(&pattern.to_lowercase()))
}
