#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::flow::schema::PieceSettings;
use crate::core::flow::state::StepError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One action exposed by a connector.
#[async_trait]
pub trait PieceAction: Send + Sync + 'static {
    fn props_schema(&self) -> Value {
        json!({})
    }

    async fn run(&self, ctx: ActionContext) -> Result<Value, AppError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceKey {
    pub piece_name: String,
    pub piece_version: String,
    pub action_name: String,
}

impl PieceKey {
    pub fn new(piece_name: &str, piece_version: &str, action_name: &str) -> Self {
        Self {
            piece_name: piece_name.to_string(),
            piece_version: piece_version.to_string(),
            action_name: action_name.to_string(),
        }
    }
}

impl std::fmt::Display for PieceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            self.piece_name, self.piece_version, self.action_name
        )
    }
}

#[derive(Default)]
pub struct PieceRegistryBuilder {
    actions: HashMap<PieceKey, Arc<dyn PieceAction>>,
}

impl PieceRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A>(&mut self, key: PieceKey, action: A) -> Result<(), AppError>
    where
        A: PieceAction,
    {
        if self.actions.contains_key(&key) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("piece action {} already registered", key),
            )
            .with_code("FLW-PIECE-003"));
        }
        self.actions.insert(key, Arc::new(action));
        Ok(())
    }

    pub fn build(self) -> PieceRegistry {
        PieceRegistry {
            actions: Arc::new(self.actions),
        }
    }
}

/// Connector actions available to PIECE steps.
#[derive(Clone, Default)]
pub struct PieceRegistry {
    actions: Arc<HashMap<PieceKey, Arc<dyn PieceAction>>>,
}

impl PieceRegistry {
    pub fn builder() -> PieceRegistryBuilder {
        PieceRegistryBuilder::new()
    }

    pub fn get_action(
        &self,
        piece_name: &str,
        piece_version: &str,
        action_name: &str,
    ) -> Option<Arc<dyn PieceAction>> {
        self.actions
            .get(&PieceKey::new(piece_name, piece_version, action_name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, AppError>;
    async fn put(&self, key: &str, value: Value) -> Result<(), AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Value>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), AppError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Key-value access confined to one flow and connector.
#[derive(Clone)]
pub struct ScopedStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, flow_id: &str, piece_name: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}/{}/", flow_id, piece_name),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        self.inner.get(&self.key(key)).await
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<(), AppError> {
        self.inner.put(&self.key(key), value).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.inner.delete(&self.key(key)).await
    }
}

/// Blob sink for connector output files.
#[async_trait]
pub trait FileWriter: Send + Sync + 'static {
    /// Store `bytes` for a run and return a reference the flow can pass on.
    async fn write(&self, run_id: &str, file_name: &str, bytes: &[u8]) -> Result<String, AppError>;
}

/// Writes files under `<root>/<run_id>/`.
pub struct LocalFileWriter {
    root: PathBuf,
}

impl LocalFileWriter {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn for_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(".flowrun").join("files"))
    }
}

#[async_trait]
impl FileWriter for LocalFileWriter {
    async fn write(&self, run_id: &str, file_name: &str, bytes: &[u8]) -> Result<String, AppError> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id == ".." {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("invalid run id '{}'", run_id),
            )
            .with_code("FLW-PIECE-004"));
        }
        let name = Path::new(file_name).file_name().ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("invalid file name '{}'", file_name),
            )
            .with_code("FLW-PIECE-004")
        })?;
        let dir = self.root.join(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path.display().to_string())
    }
}

/// File access bound to the current run.
#[derive(Clone)]
pub struct RunFiles {
    writer: Arc<dyn FileWriter>,
    run_id: String,
}

impl RunFiles {
    pub fn new(writer: Arc<dyn FileWriter>, run_id: &str) -> Self {
        Self {
            writer,
            run_id: run_id.to_string(),
        }
    }

    pub async fn write(&self, file_name: &str, bytes: &[u8]) -> Result<String, AppError> {
        self.writer.write(&self.run_id, file_name, bytes).await
    }
}

/// Everything an action sees while it runs.
#[derive(Clone)]
pub struct ActionContext {
    pub auth: Value,
    pub props_value: Value,
    pub store: ScopedStore,
    pub files: RunFiles,
    pub run_id: String,
    pub flow_id: String,
    pub step_name: String,
}

/// Look up and run the action for a PIECE step.
pub async fn run_piece_step(
    registry: &PieceRegistry,
    settings: &PieceSettings,
    ctx: ActionContext,
) -> Result<Value, StepError> {
    let action = registry
        .get_action(
            &settings.piece_name,
            &settings.piece_version,
            &settings.action_name,
        )
        .ok_or_else(|| {
            StepError::new(
                "FLW-PIECE-001",
                format!(
                    "action {}@{}:{} is not registered",
                    settings.piece_name, settings.piece_version, settings.action_name
                ),
            )
        })?;
    let step_name = ctx.step_name.clone();
    action.run(ctx).await.map_err(|err| {
        StepError::new(
            "FLW-PIECE-002",
            format!(
                "step '{}' ({}): {}",
                step_name, settings.piece_name, err.message
            ),
        )
    })
}
