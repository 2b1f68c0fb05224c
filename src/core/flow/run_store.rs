#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::flow::executor::RunResult;
use crate::core::flow::state::redact_value;
use crate::core::types::ErrorCategory;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const RUN_FILE: &str = "run.json";

/// `<workspace>/.flowrun/runs`
pub fn runs_dir(workspace: &Path) -> PathBuf {
    workspace.join(".flowrun").join("runs")
}

pub fn run_path(workspace: &Path, run_id: &str) -> PathBuf {
    runs_dir(workspace).join(run_id).join(RUN_FILE)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to create directory {}: {}", parent.display(), err),
            )
            .with_code("RUN-STORE-001")
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to write {}: {}", tmp_path.display(), err),
        )
        .with_code("RUN-STORE-001")
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!(
                "failed to rename {} -> {}: {}",
                tmp_path.display(),
                path.display(),
                err
            ),
        )
        .with_code("RUN-STORE-001")
    })
}

fn checked_run_path(workspace: &Path, run_id: &str) -> Result<PathBuf, AppError> {
    if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id == ".." || run_id == "." {
        return Err(AppError::new(
            ErrorCategory::ValidationError,
            format!("run id '{}' cannot be used as a directory name", run_id),
        )
        .with_code("RUN-STORE-002"));
    }
    Ok(run_path(workspace, run_id))
}

/// Persist a finished run with secret-looking keys redacted.
pub fn save_run(
    workspace: &Path,
    result: &RunResult,
    redact_keys: &[String],
) -> Result<PathBuf, AppError> {
    let path = checked_run_path(workspace, &result.run_id)?;
    let mut value = serde_json::to_value(result)?;
    redact_value(&mut value, redact_keys);
    atomic_write(&path, &serde_json::to_vec_pretty(&value)?)?;
    tracing::debug!(run_id = %result.run_id, path = %path.display(), "run persisted");
    Ok(path)
}

/// Load a persisted run. Redacted values stay redacted.
pub fn load_run(workspace: &Path, run_id: &str) -> Result<Value, AppError> {
    let path = checked_run_path(workspace, run_id)?;
    let content = fs::read_to_string(&path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to read run {}: {}", path.display(), err),
        )
        .with_code("RUN-STORE-003")
    })?;
    Ok(serde_json::from_str(&content)?)
}
