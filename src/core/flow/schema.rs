#![allow(clippy::result_large_err)] // Flow schema APIs return AppError to preserve structured validation context without boxing.

use crate::core::error::AppError;
use crate::core::flow::condition::BranchSettings;
use crate::core::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names that cannot be used for steps because placeholders reserve them.
const RESERVED_NAMES: &[&str] = &["configs"];

/// Placeholder root that always refers to the flow's trigger step.
pub const TRIGGER_ROOT: &str = "trigger";

fn default_version() -> String {
    "1".to_string()
}

fn default_settings() -> Value {
    Value::Object(Map::new())
}

/// Authored flow document: a trigger with nested step descriptors.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowDescriptor {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub configs: Map<String, Value>,
    pub trigger: StepDescriptor,
    /// Top-level chain after the trigger, for flows too long to nest through
    /// `next`. Entries keep their own branch and loop bodies but no `next`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Trigger,
    Code,
    Branch,
    LoopOnItems,
    Piece,
}

/// A single step as authored, with its successors nested inline.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default = "default_settings")]
    pub settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<StepDescriptor>>,
    #[serde(default, alias = "onTrue", skip_serializing_if = "Option::is_none")]
    pub on_true: Option<Box<StepDescriptor>>,
    #[serde(default, alias = "onFalse", skip_serializing_if = "Option::is_none")]
    pub on_false: Option<Box<StepDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<StepDescriptor>>,
    #[serde(default, alias = "errorHandling", skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
}

/// Declarative failure policy attached to a step.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ErrorHandling {
    #[serde(default, alias = "continueOnFailure")]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Retry configuration for a step.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    #[serde(default)]
    pub jitter_ms: Option<u64>,
}

impl RetryPolicy {
    /// Ensure the retry policy is sane.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "retry.max_attempts must be >= 1",
            )
            .with_code("FLW-SCHEMA-005"));
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.unwrap_or(1.0).max(0.0);
        let millis = (self.delay_ms as f64) * multiplier.powi(attempt as i32);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

/// Where the source of a CODE step lives.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum CodeSourceSpec {
    Inline {
        code: String,
        #[serde(default, alias = "packageJson")]
        package_json: Value,
    },
    Archive {
        #[serde(alias = "archivePath")]
        archive_path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CodeSettings {
    /// Cache key for the built artifact; defaults to `<flow_id>/<version>/<step>`.
    #[serde(default, alias = "artifactId")]
    pub artifact_id: Option<String>,
    pub source: CodeSourceSpec,
    #[serde(default = "default_settings")]
    pub input: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoopSettings {
    /// Template resolving to the array to iterate, usually a single placeholder.
    #[serde(alias = "itemsExpr", alias = "items_expr")]
    pub items: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PieceSettings {
    #[serde(alias = "pieceName")]
    pub piece_name: String,
    #[serde(alias = "pieceVersion")]
    pub piece_version: String,
    #[serde(alias = "actionName")]
    pub action_name: String,
    #[serde(default = "default_settings")]
    pub input: Value,
    #[serde(default)]
    pub auth: Value,
}

/// Stable index of a step inside a compiled flow.
pub type StepId = usize;

#[derive(Debug, Clone)]
pub enum StepKind {
    Trigger,
    Code(CodeSettings),
    Branch {
        settings: BranchSettings,
        on_true: Option<StepId>,
        on_false: Option<StepId>,
    },
    LoopOnItems {
        settings: LoopSettings,
        body: Option<StepId>,
    },
    Piece(PieceSettings),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Trigger => "TRIGGER",
            StepKind::Code(_) => "CODE",
            StepKind::Branch { .. } => "BRANCH",
            StepKind::LoopOnItems { .. } => "LOOP_ON_ITEMS",
            StepKind::Piece(_) => "PIECE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: StepId,
    pub name: String,
    pub kind: StepKind,
    pub next: Option<StepId>,
    pub parent: Option<StepId>,
    pub error_handling: ErrorHandling,
}

/// Immutable, compiled step graph shared read-only across runs.
#[derive(Debug, Clone)]
pub struct FlowVersion {
    pub id: String,
    pub version: String,
    pub configs: Map<String, Value>,
    steps: Vec<StepNode>,
    root: StepId,
}

impl FlowVersion {
    /// Flatten a descriptor tree into an arena and validate it.
    pub fn compile(descriptor: FlowDescriptor) -> Result<Self, AppError> {
        if descriptor.id.trim().is_empty() {
            return Err(schema_error("FLW-SCHEMA-001", "flow id cannot be empty"));
        }
        if descriptor.trigger.step_type != StepType::Trigger {
            return Err(schema_error(
                "FLW-SCHEMA-002",
                format!(
                    "flow root step '{}' must be of type TRIGGER",
                    descriptor.trigger.name
                ),
            ));
        }

        let mut compiler = Compiler {
            flow_id: &descriptor.id,
            flow_version: &descriptor.version,
            steps: Vec::new(),
            names: HashSet::new(),
        };
        let root = compiler.compile_chain(&descriptor.trigger, None, true)?;
        compiler.append_flat(root, &descriptor)?;

        Ok(FlowVersion {
            id: descriptor.id.clone(),
            version: descriptor.version.clone(),
            configs: descriptor.configs,
            steps: compiler.steps,
            root,
        })
    }

    pub fn trigger(&self) -> &StepNode {
        &self.steps[self.root]
    }

    pub fn step(&self, id: StepId) -> &StepNode {
        &self.steps[id]
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepNode> {
        self.steps.iter().find(|node| node.name == name)
    }

    pub fn steps(&self) -> &[StepNode] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

struct Compiler<'a> {
    flow_id: &'a str,
    flow_version: &'a str,
    steps: Vec<StepNode>,
    names: HashSet<String>,
}

impl Compiler<'_> {
    fn compile_chain(
        &mut self,
        first: &StepDescriptor,
        parent: Option<StepId>,
        is_root: bool,
    ) -> Result<StepId, AppError> {
        let head = self.compile_node(first, parent, is_root)?;
        let mut previous = head;
        let mut current = first.next.as_deref();
        while let Some(descriptor) = current {
            let id = self.compile_node(descriptor, parent, false)?;
            self.steps[previous].next = Some(id);
            previous = id;
            current = descriptor.next.as_deref();
        }
        Ok(head)
    }

    fn append_flat(&mut self, root: StepId, descriptor: &FlowDescriptor) -> Result<(), AppError> {
        if descriptor.steps.is_empty() {
            return Ok(());
        }
        if descriptor.trigger.next.is_some() {
            return Err(schema_error(
                "FLW-SCHEMA-006",
                "trigger.next and top-level steps cannot both define the main chain",
            ));
        }
        let mut previous = root;
        for step in &descriptor.steps {
            if step.next.is_some() {
                return Err(schema_error(
                    "FLW-SCHEMA-006",
                    format!("step '{}': entries of top-level steps cannot set next", step.name),
                ));
            }
            let id = self.compile_node(step, None, false)?;
            self.steps[previous].next = Some(id);
            previous = id;
        }
        Ok(())
    }

    fn compile_node(
        &mut self,
        descriptor: &StepDescriptor,
        parent: Option<StepId>,
        is_root: bool,
    ) -> Result<StepId, AppError> {
        validate_step_name(&descriptor.name)?;
        if !is_root && descriptor.name == TRIGGER_ROOT {
            return Err(schema_error(
                "FLW-SCHEMA-007",
                format!("step name '{}' is reserved for the trigger", descriptor.name),
            ));
        }
        if !self.names.insert(descriptor.name.clone()) {
            return Err(schema_error(
                "FLW-SCHEMA-003",
                format!("duplicate step name: {}", descriptor.name),
            ));
        }
        if is_root != (descriptor.step_type == StepType::Trigger) {
            return Err(schema_error(
                "FLW-SCHEMA-002",
                format!(
                    "step '{}': TRIGGER is only allowed as the flow root",
                    descriptor.name
                ),
            ));
        }

        let error_handling = descriptor.error_handling.clone().unwrap_or_default();
        if let Some(retry) = &error_handling.retry {
            retry.validate()?;
        }

        let kind = match descriptor.step_type {
            StepType::Trigger => StepKind::Trigger,
            StepType::Code => {
                let mut settings: CodeSettings = parse_settings(descriptor)?;
                if settings.artifact_id.is_none() {
                    settings.artifact_id = Some(format!(
                        "{}/{}/{}",
                        self.flow_id, self.flow_version, descriptor.name
                    ));
                }
                StepKind::Code(settings)
            }
            StepType::Branch => StepKind::Branch {
                settings: parse_settings(descriptor)?,
                on_true: None,
                on_false: None,
            },
            StepType::LoopOnItems => StepKind::LoopOnItems {
                settings: parse_settings(descriptor)?,
                body: None,
            },
            StepType::Piece => StepKind::Piece(parse_settings(descriptor)?),
        };

        let has_branch_edges = descriptor.on_true.is_some() || descriptor.on_false.is_some();
        if has_branch_edges && descriptor.step_type != StepType::Branch {
            return Err(schema_error(
                "FLW-SCHEMA-006",
                format!("step '{}': on_true/on_false require BRANCH", descriptor.name),
            ));
        }
        if descriptor.body.is_some() && descriptor.step_type != StepType::LoopOnItems {
            return Err(schema_error(
                "FLW-SCHEMA-006",
                format!("step '{}': body requires LOOP_ON_ITEMS", descriptor.name),
            ));
        }

        let id = self.steps.len();
        self.steps.push(StepNode {
            id,
            name: descriptor.name.clone(),
            kind,
            next: None,
            parent,
            error_handling,
        });

        let true_edge = self.compile_edge(descriptor.on_true.as_deref(), id)?;
        let false_edge = self.compile_edge(descriptor.on_false.as_deref(), id)?;
        let body_edge = self.compile_edge(descriptor.body.as_deref(), id)?;

        match &mut self.steps[id].kind {
            StepKind::Branch {
                on_true, on_false, ..
            } => {
                *on_true = true_edge;
                *on_false = false_edge;
            }
            StepKind::LoopOnItems { body, .. } => *body = body_edge,
            _ => {}
        }

        Ok(id)
    }

    fn compile_edge(
        &mut self,
        descriptor: Option<&StepDescriptor>,
        parent: StepId,
    ) -> Result<Option<StepId>, AppError> {
        descriptor
            .map(|first| self.compile_chain(first, Some(parent), false))
            .transpose()
    }
}

fn parse_settings<T: serde::de::DeserializeOwned>(
    descriptor: &StepDescriptor,
) -> Result<T, AppError> {
    serde_json::from_value(descriptor.settings.clone()).map_err(|err| {
        schema_error(
            "FLW-SCHEMA-004",
            format!(
                "step '{}': invalid {:?} settings: {}",
                descriptor.name, descriptor.step_type, err
            ),
        )
    })
}

/// Step names double as placeholder roots, so they must be plain identifiers.
pub fn validate_step_name(name: &str) -> Result<(), AppError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(schema_error(
            "FLW-SCHEMA-007",
            format!("step name '{}' is not a valid identifier", name),
        ));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(schema_error(
            "FLW-SCHEMA-007",
            format!("step name '{}' is reserved", name),
        ));
    }
    Ok(())
}

fn schema_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code(code)
}

/// Parse a flow descriptor from YAML or JSON text.
pub fn parse_flow(text: &str, json: bool) -> Result<FlowVersion, AppError> {
    let descriptor: FlowDescriptor = if json {
        serde_json::from_str(text).map_err(|err| parse_error(err.to_string()))?
    } else {
        serde_yaml::from_str(text).map_err(|err| parse_error(err.to_string()))?
    };
    FlowVersion::compile(descriptor)
}

/// Both parsers stop at 128 levels, which nested `next` chains reach at
/// roughly 120 steps.
fn parse_error(reason: String) -> AppError {
    let mut message = format!("failed to parse flow: {}", reason);
    if reason.contains("recursion limit exceeded") {
        message.push_str("; list long chains under top-level `steps` instead of nesting `next`");
    }
    schema_error("FLW-SCHEMA-000", message)
}

/// Load and compile a flow from a `.yaml`, `.yml` or `.json` file.
pub fn load_flow(path: &Path) -> Result<FlowVersion, AppError> {
    let text = fs::read_to_string(path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to read {}: {}", path.display(), err),
        )
    })?;
    let json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    parse_flow(&text, json).map_err(|mut err| {
        err.add_context("path", &path.display().to_string());
        err
    })
}
