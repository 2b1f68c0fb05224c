#![allow(clippy::result_large_err)]

use super::meta::SandboxMeta;
use super::{limit_bytes, SandboxCommand, SandboxOutcome, SandboxStatus};
use crate::core::config::{SandboxBackendKind, SandboxConfig};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const ISOLATE_STDOUT: &str = ".flowrun.stdout";
const ISOLATE_STDERR: &str = ".flowrun.stderr";
const ISOLATE_GRACE: Duration = Duration::from_secs(5);

/// Box lifecycle primitives. A box is addressed by its pool index.
#[async_trait]
pub trait SandboxBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Prepare an empty box and return its scratch directory.
    async fn init(&self, box_id: usize) -> Result<PathBuf, AppError>;

    /// Remove everything the previous execution left behind.
    async fn cleanup(&self, box_id: usize) -> Result<(), AppError>;

    async fn run(&self, box_id: usize, command: &SandboxCommand)
        -> Result<SandboxOutcome, AppError>;

    fn scratch_dir(&self, box_id: usize) -> PathBuf;
}

/// Build the backend selected in config.
pub fn backend_from_config(
    config: &SandboxConfig,
    workspace: &Path,
) -> Arc<dyn SandboxBackend> {
    let base_dir = config.base_dir_in(workspace);
    match config.backend {
        SandboxBackendKind::Process => {
            Arc::new(ProcessBackend::new(base_dir, config.output_limit_bytes))
        }
        SandboxBackendKind::Isolate => Arc::new(IsolateBackend::new(
            config.isolate_binary.clone(),
            base_dir,
            config.output_limit_bytes,
        )),
    }
}

fn sandbox_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::SandboxError, message).with_code(code)
}

/// Plain child processes confined with `ulimit`, a cleared environment and,
/// when networking is disallowed, a fresh network namespace via `unshare`.
pub struct ProcessBackend {
    base_dir: PathBuf,
    output_limit_bytes: usize,
}

impl ProcessBackend {
    pub fn new(base_dir: PathBuf, output_limit_bytes: usize) -> Self {
        Self {
            base_dir,
            output_limit_bytes,
        }
    }

    fn script(command: &SandboxCommand) -> String {
        let limits = &command.limits;
        format!(
            "ulimit -t {} 2>/dev/null; ulimit -v {} 2>/dev/null; ulimit -u {} 2>/dev/null; {}",
            limits.cpu_time_seconds, limits.memory_limit_kb, limits.max_processes, command.command
        )
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn init(&self, box_id: usize) -> Result<PathBuf, AppError> {
        let dir = self.scratch_dir(box_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            sandbox_error(
                "SBX-001",
                format!("failed to create box dir {}: {}", dir.display(), err),
            )
        })?;
        Ok(dir)
    }

    async fn cleanup(&self, box_id: usize) -> Result<(), AppError> {
        let dir = self.scratch_dir(box_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(sandbox_error(
                "SBX-004",
                format!("failed to wipe box dir {}: {}", dir.display(), err),
            )),
        }
    }

    async fn run(
        &self,
        box_id: usize,
        command: &SandboxCommand,
    ) -> Result<SandboxOutcome, AppError> {
        let scratch = self.scratch_dir(box_id);
        if !scratch.is_dir() {
            return Err(sandbox_error(
                "SBX-002",
                format!("box {} is not initialised", box_id),
            ));
        }

        let script = Self::script(command);
        let mut cmd = if command.limits.allow_network {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(&script);
            cmd
        } else {
            let mut cmd = Command::new("unshare");
            cmd.arg("-rn").arg("bash").arg("-c").arg(&script);
            cmd
        };
        cmd.current_dir(&scratch)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &scratch)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Ok(SandboxOutcome::internal_error(format!(
                    "failed to spawn sandboxed process: {}",
                    err
                )))
            }
        };
        let mut group = ProcessGroupGuard { pid: child.id() };

        let waited = tokio::time::timeout(command.limits.wall_time, child.wait_with_output()).await;
        let output = match waited {
            Err(_) => {
                tracing::warn!(box_id, "sandboxed command exceeded wall time");
                return Ok(SandboxOutcome::timed_out(command.limits.wall_time));
            }
            Ok(Err(err)) => {
                return Ok(SandboxOutcome::internal_error(format!(
                    "failed to wait for sandboxed process: {}",
                    err
                )))
            }
            Ok(Ok(output)) => output,
        };
        group.disarm();

        let status = match output.status.code() {
            Some(0) => SandboxStatus::Ok,
            Some(_) => SandboxStatus::RuntimeError,
            None => SandboxStatus::Signaled,
        };
        Ok(SandboxOutcome {
            exit_code: output.status.code(),
            status,
            stdout: limit_bytes(&output.stdout, self.output_limit_bytes),
            stderr: limit_bytes(&output.stderr, self.output_limit_bytes),
            duration_ms: started.elapsed().as_millis() as u64,
            max_rss_kb: None,
        })
    }

    fn scratch_dir(&self, box_id: usize) -> PathBuf {
        self.base_dir.join(format!("box-{}", box_id))
    }
}

/// Kills the whole process group of a sandboxed command unless disarmed, so
/// grandchildren die with it on timeout or when the run future is dropped.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    /// Fire and forget: drop runs on a runtime worker, so never wait on `kill`.
    fn drop(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        let group = format!("-{}", pid);
        let spawned = if tokio::runtime::Handle::try_current().is_ok() {
            // tokio reaps the dropped child in the background.
            Command::new("kill")
                .args(["-KILL", "--", group.as_str()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map(drop)
        } else {
            std::process::Command::new("kill")
                .args(["-KILL", "--", group.as_str()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map(drop)
        };
        if let Err(err) = spawned {
            tracing::warn!(pid, error = %err, "failed to signal sandboxed process group");
        }
    }
}

/// Drives the `isolate` CLI: `--init`, `--cleanup` and `--run` with a meta file.
pub struct IsolateBackend {
    binary: String,
    meta_dir: PathBuf,
    output_limit_bytes: usize,
    boxes: DashMap<usize, PathBuf>,
}

impl IsolateBackend {
    pub fn new(binary: String, meta_dir: PathBuf, output_limit_bytes: usize) -> Self {
        Self {
            binary,
            meta_dir,
            output_limit_bytes,
            boxes: DashMap::new(),
        }
    }

    pub fn run_args(&self, box_id: usize, command: &SandboxCommand, meta: &Path) -> Vec<String> {
        let limits = &command.limits;
        let mut args = vec![
            format!("--box-id={}", box_id),
            format!("--wall-time={:.3}", limits.wall_time.as_secs_f64()),
            format!("--time={}", limits.cpu_time_seconds),
            format!("--mem={}", limits.memory_limit_kb),
            format!("--processes={}", limits.max_processes),
            format!("--meta={}", meta.display()),
            format!("--stdout={}", ISOLATE_STDOUT),
            format!("--stderr={}", ISOLATE_STDERR),
            "--chdir=/box".to_string(),
            format!("--env=PATH={}", SANDBOX_PATH),
            "--env=HOME=/box".to_string(),
        ];
        for (key, value) in &command.env {
            args.push(format!("--env={}={}", key, value));
        }
        if limits.allow_network {
            args.push("--share-net".to_string());
        }
        args.push("--run".to_string());
        args.push("--".to_string());
        args.push("/bin/bash".to_string());
        args.push("-c".to_string());
        args.push(command.command.clone());
        args
    }

    async fn read_capture(&self, path: &Path) -> String {
        match tokio::fs::read(path).await {
            Ok(bytes) => limit_bytes(&bytes, self.output_limit_bytes),
            Err(_) => String::new(),
        }
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn init(&self, box_id: usize) -> Result<PathBuf, AppError> {
        let output = Command::new(&self.binary)
            .arg(format!("--box-id={}", box_id))
            .arg("--init")
            .output()
            .await
            .map_err(|err| {
                sandbox_error("SBX-001", format!("failed to invoke {}: {}", self.binary, err))
            })?;
        if !output.status.success() {
            return Err(sandbox_error(
                "SBX-001",
                format!(
                    "isolate --init failed for box {}: {}",
                    box_id,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let scratch = PathBuf::from(root).join("box");
        self.boxes.insert(box_id, scratch.clone());
        Ok(scratch)
    }

    async fn cleanup(&self, box_id: usize) -> Result<(), AppError> {
        let output = Command::new(&self.binary)
            .arg(format!("--box-id={}", box_id))
            .arg("--cleanup")
            .output()
            .await
            .map_err(|err| {
                sandbox_error("SBX-004", format!("failed to invoke {}: {}", self.binary, err))
            })?;
        if !output.status.success() {
            return Err(sandbox_error(
                "SBX-004",
                format!(
                    "isolate --cleanup failed for box {}: {}",
                    box_id,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        self.boxes.remove(&box_id);
        Ok(())
    }

    async fn run(
        &self,
        box_id: usize,
        command: &SandboxCommand,
    ) -> Result<SandboxOutcome, AppError> {
        tokio::fs::create_dir_all(&self.meta_dir).await?;
        let meta_path = self.meta_dir.join(format!("box-{}.meta", box_id));
        let _ = tokio::fs::remove_file(&meta_path).await;

        let child = Command::new(&self.binary)
            .args(self.run_args(box_id, command, &meta_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return Ok(SandboxOutcome::internal_error(format!(
                    "failed to invoke {}: {}",
                    self.binary, err
                )))
            }
        };

        let budget = command.limits.wall_time + ISOLATE_GRACE;
        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Err(_) => return Ok(SandboxOutcome::timed_out(command.limits.wall_time)),
            Ok(Err(err)) => {
                return Ok(SandboxOutcome::internal_error(format!(
                    "failed to wait for isolate: {}",
                    err
                )))
            }
            Ok(Ok(output)) => output,
        };

        let meta_text = match tokio::fs::read_to_string(&meta_path).await {
            Ok(text) => text,
            Err(_) => {
                return Ok(SandboxOutcome::internal_error(format!(
                    "isolate produced no meta file: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        };
        let meta = SandboxMeta::parse(&meta_text)
            .map_err(|err| sandbox_error("SBX-005", format!("invalid meta file: {}", err)))?;

        let scratch = self.scratch_dir(box_id);
        let stdout = self.read_capture(&scratch.join(ISOLATE_STDOUT)).await;
        let stderr = self.read_capture(&scratch.join(ISOLATE_STDERR)).await;
        let _ = tokio::fs::remove_file(scratch.join(ISOLATE_STDOUT)).await;
        let _ = tokio::fs::remove_file(scratch.join(ISOLATE_STDERR)).await;
        Ok(meta.into_outcome(stdout, stderr))
    }

    fn scratch_dir(&self, box_id: usize) -> PathBuf {
        self.boxes
            .get(&box_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| PathBuf::from(format!("/var/local/lib/isolate/{}/box", box_id)))
    }
}
