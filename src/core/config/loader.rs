#![allow(clippy::result_large_err)]

use super::{ConfigValidator, RuntimeConfig};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "flowrun.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from workspace root (workspace/flowrun.toml).
    /// Environment variables override file values; the result is validated.
    pub fn load_from_workspace(workspace_path: &Path) -> Result<RuntimeConfig, AppError> {
        let config_path = workspace_path.join(CONFIG_FILE_NAME);
        let config_file = Self::load_from_file(&config_path)?;

        let mut config = config_file.unwrap_or_default();

        Self::apply_env_overrides(&mut config);
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Returns Ok(None) if file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<RuntimeConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
            .with_code("CFG-001")
        })?;

        let config: RuntimeConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("CFG-002")
        })?;

        Ok(Some(config))
    }

    fn apply_env_overrides(config: &mut RuntimeConfig) {
        // Sandbox overrides
        if let Ok(backend) = env::var("FLOWRUN_SANDBOX_BACKEND") {
            match backend.parse() {
                Ok(kind) => config.sandbox.backend = kind,
                Err(err) => tracing::warn!("ignoring FLOWRUN_SANDBOX_BACKEND: {}", err),
            }
        }

        if let Ok(pool_size_str) = env::var("FLOWRUN_SANDBOX_POOL_SIZE") {
            if let Ok(pool_size) = pool_size_str.parse::<usize>() {
                config.sandbox.pool_size = pool_size;
            }
        }

        if let Ok(base_dir) = env::var("FLOWRUN_SANDBOX_BASE_DIR") {
            config.sandbox.base_dir = Some(PathBuf::from(base_dir));
        }

        if let Ok(allow_network_str) = env::var("FLOWRUN_SANDBOX_ALLOW_NETWORK") {
            if let Ok(allow_network) = allow_network_str.parse::<bool>() {
                config.sandbox.allow_network = allow_network;
            }
        }

        // Builder overrides
        if let Ok(install_command) = env::var("FLOWRUN_BUILDER_INSTALL_COMMAND") {
            config.builder.install_command = install_command;
        }

        if let Ok(build_command) = env::var("FLOWRUN_BUILDER_BUILD_COMMAND") {
            config.builder.build_command = build_command;
        }

        if let Ok(runtime_command) = env::var("FLOWRUN_CODE_RUNTIME_COMMAND") {
            config.code.runtime_command = runtime_command;
        }

        if let Ok(max_time_str) = env::var("FLOWRUN_RUN_MAX_TIME_SECONDS") {
            if let Ok(max_time) = max_time_str.parse::<u64>() {
                config.run.max_time_seconds = max_time;
            }
        }

        if let Ok(concurrency_str) = env::var("FLOWRUN_JOBS_CONCURRENCY") {
            if let Ok(concurrency) = concurrency_str.parse::<usize>() {
                config.jobs.concurrency = concurrency;
            }
        }
    }

    /// Get documentation for supported environment variables
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "FLOWRUN_SANDBOX_BACKEND - Override sandbox backend (process/isolate, default: process)",
            "FLOWRUN_SANDBOX_POOL_SIZE - Override number of sandbox boxes (default: 20)",
            "FLOWRUN_SANDBOX_BASE_DIR - Override sandbox scratch root (default: .flowrun/sandbox)",
            "FLOWRUN_SANDBOX_ALLOW_NETWORK - Override network policy for sandboxed commands (true/false)",
            "FLOWRUN_BUILDER_INSTALL_COMMAND - Override dependency install command",
            "FLOWRUN_BUILDER_BUILD_COMMAND - Override bundle command (default: npm run build)",
            "FLOWRUN_CODE_RUNTIME_COMMAND - Override CODE step runtime command (default: node run.js)",
            "FLOWRUN_RUN_MAX_TIME_SECONDS - Override whole-run timeout (default: 600)",
            "FLOWRUN_JOBS_CONCURRENCY - Override number of concurrently executing jobs (default: 4)",
        ]
    }
}
