pub mod backend;
pub mod meta;
pub mod pool;

use crate::core::config::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use backend::{IsolateBackend, ProcessBackend, SandboxBackend};
pub use meta::{MetaParseError, SandboxMeta};
pub use pool::{BoxState, PoolStats, SandboxBox, SandboxLease, SandboxPool};

/// Resource policy applied to one sandboxed command.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub wall_time: Duration,
    pub cpu_time_seconds: u64,
    pub memory_limit_kb: u64,
    pub max_processes: u32,
    pub allow_network: bool,
}

impl SandboxLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        SandboxLimits {
            wall_time: config.wall_time(),
            cpu_time_seconds: config.cpu_time_seconds,
            memory_limit_kb: config.memory_limit_kb,
            max_processes: config.max_processes,
            allow_network: config.allow_network,
        }
    }

    /// Same policy with a different wall clock budget; CPU time never exceeds it.
    pub fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time = wall_time;
        self.cpu_time_seconds = self.cpu_time_seconds.min(wall_time.as_secs().max(1));
        self
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits::from_config(&SandboxConfig::default())
    }
}

/// A shell command to run inside a box, with the box scratch dir as cwd.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub command: String,
    pub limits: SandboxLimits,
    pub env: Vec<(String, String)>,
}

impl SandboxCommand {
    pub fn new(command: impl Into<String>, limits: SandboxLimits) -> Self {
        SandboxCommand {
            command: command.into(),
            limits,
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    Ok,
    RuntimeError,
    TimedOut,
    Signaled,
    InternalError,
}

/// Result of a sandboxed command. Non-zero exits are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub exit_code: Option<i32>,
    pub status: SandboxStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub max_rss_kb: Option<u64>,
}

impl SandboxOutcome {
    pub fn is_success(&self) -> bool {
        self.status == SandboxStatus::Ok && self.exit_code == Some(0)
    }

    pub fn timed_out(duration: Duration) -> Self {
        SandboxOutcome {
            exit_code: None,
            status: SandboxStatus::TimedOut,
            stdout: String::new(),
            stderr: format!("wall time limit of {}ms exceeded", duration.as_millis()),
            duration_ms: duration.as_millis() as u64,
            max_rss_kb: None,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        SandboxOutcome {
            exit_code: None,
            status: SandboxStatus::InternalError,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms: 0,
            max_rss_kb: None,
        }
    }

    /// Combined log used for build output and step diagnostics.
    pub fn log(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

pub(crate) fn limit_bytes(bytes: &[u8], limit: usize) -> String {
    let limit = limit.min(bytes.len());
    String::from_utf8_lossy(&bytes[..limit]).into_owned()
}
