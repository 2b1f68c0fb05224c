use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration loaded from flowrun.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Sandbox pool configuration
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Code builder configuration
    #[serde(default)]
    pub builder: BuilderConfig,

    /// CODE step execution configuration
    #[serde(default)]
    pub code: CodeConfig,

    /// Flow run configuration
    #[serde(default)]
    pub run: RunConfig,

    /// System job configuration
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Which isolation backend the sandbox pool drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackendKind {
    #[default]
    Process,
    Isolate,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(SandboxBackendKind::Process),
            "isolate" => Ok(SandboxBackendKind::Isolate),
            other => Err(format!("unknown sandbox backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackendKind,

    /// Number of boxes created at process start
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Root of per-box scratch directories; relative paths resolve against the workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,

    #[serde(default = "default_isolate_binary")]
    pub isolate_binary: String,

    #[serde(default = "default_wall_time_seconds")]
    pub wall_time_seconds: u64,

    #[serde(default = "default_cpu_time_seconds")]
    pub cpu_time_seconds: u64,

    #[serde(default = "default_memory_limit_kb")]
    pub memory_limit_kb: u64,

    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    #[serde(default = "default_true")]
    pub allow_network: bool,

    /// Per-stream capture limit for stdout/stderr
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    #[serde(default = "default_install_command")]
    pub install_command: String,

    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Bundle path relative to the box scratch directory
    #[serde(default = "default_output_file")]
    pub output_file: String,

    #[serde(default = "default_builder_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeConfig {
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,

    #[serde(default = "default_code_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_time_seconds")]
    pub max_time_seconds: u64,

    #[serde(default = "default_true")]
    pub persist_runs: bool,

    /// Config keys whose values are masked in persisted runs
    #[serde(default = "default_redact_keys")]
    pub redact_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_jobs_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_jobs_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_jobs_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_pool_size() -> usize {
    20
}

fn default_isolate_binary() -> String {
    "isolate".to_string()
}

fn default_wall_time_seconds() -> u64 {
    30
}

fn default_cpu_time_seconds() -> u64 {
    20
}

fn default_memory_limit_kb() -> u64 {
    512 * 1024
}

fn default_max_processes() -> u32 {
    64
}

fn default_true() -> bool {
    true
}

fn default_output_limit_bytes() -> usize {
    1024 * 1024
}

fn default_install_command() -> String {
    "npm install --no-audit --no-fund --ignore-scripts".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_output_file() -> String {
    "dist/index.js".to_string()
}

fn default_builder_timeout_seconds() -> u64 {
    120
}

fn default_runtime_command() -> String {
    "node run.js".to_string()
}

fn default_code_timeout_seconds() -> u64 {
    15
}

fn default_max_time_seconds() -> u64 {
    600
}

fn default_redact_keys() -> Vec<String> {
    vec![
        "token".to_string(),
        "password".to_string(),
        "secret".to_string(),
        "api_key".to_string(),
    ]
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_jobs_concurrency() -> usize {
    4
}

fn default_jobs_max_attempts() -> u32 {
    5
}

fn default_jobs_backoff_ms() -> u64 {
    2000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            backend: SandboxBackendKind::default(),
            pool_size: default_pool_size(),
            base_dir: None,
            isolate_binary: default_isolate_binary(),
            wall_time_seconds: default_wall_time_seconds(),
            cpu_time_seconds: default_cpu_time_seconds(),
            memory_limit_kb: default_memory_limit_kb(),
            max_processes: default_max_processes(),
            allow_network: true,
            output_limit_bytes: default_output_limit_bytes(),
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            install_command: default_install_command(),
            build_command: default_build_command(),
            output_file: default_output_file(),
            timeout_seconds: default_builder_timeout_seconds(),
            cache_dir: None,
        }
    }
}

impl Default for CodeConfig {
    fn default() -> Self {
        CodeConfig {
            runtime_command: default_runtime_command(),
            timeout_seconds: default_code_timeout_seconds(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            max_time_seconds: default_max_time_seconds(),
            persist_runs: true,
            redact_keys: default_redact_keys(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_jobs_concurrency(),
            max_attempts: default_jobs_max_attempts(),
            backoff_ms: default_jobs_backoff_ms(),
        }
    }
}

impl SandboxConfig {
    pub fn base_dir_in(&self, workspace: &Path) -> PathBuf {
        match &self.base_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => workspace.join(".flowrun").join("sandbox"),
        }
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_secs(self.wall_time_seconds)
    }
}

impl BuilderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl CodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl RunConfig {
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time_seconds)
    }
}


pub mod loader;
pub mod validation;

pub use loader::ConfigLoader;
pub use validation::ConfigValidator;
