use crate::core::builder::{ArtifactCache, BuildArtifact, CodeBuilder, CodeSource};
use crate::core::config::CodeConfig;
use crate::core::flow::schema::CodeSourceSpec;
use crate::core::flow::state::StepError;
use crate::core::sandbox::{SandboxCommand, SandboxPool, SandboxStatus};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

pub const ARTIFACT_FILE: &str = "index.js";
pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const RUNNER_FILE: &str = "run.js";

/// Loads the bundle, calls its `code` export with the input and records the
/// result or the thrown error in output.json.
pub const RUNNER_SCRIPT: &str = r#"const fs = require('fs');

(async () => {
  let result;
  try {
    const input = JSON.parse(fs.readFileSync('./input.json', 'utf8'));
    const mod = require('./index.js');
    const output = await mod.code(input);
    result = { status: 'OK', output: output === undefined ? null : output };
  } catch (e) {
    result = {
      status: 'ERROR',
      error: { message: e && e.message ? e.message : String(e), stack: e && e.stack ? e.stack : null },
    };
  }
  fs.writeFileSync('./output.json', JSON.stringify(result));
})();
"#;

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
enum RunnerResult {
    Ok {
        #[serde(default)]
        output: Value,
    },
    Error {
        error: RunnerError,
    },
}

#[derive(Debug, Deserialize)]
struct RunnerError {
    message: String,
}

impl CodeSourceSpec {
    /// Load archive bytes from disk; relative paths resolve against `workspace`.
    pub async fn load(&self, workspace: &Path) -> Result<CodeSource, StepError> {
        match self {
            CodeSourceSpec::Inline { code, package_json } => Ok(CodeSource::Inline {
                code: code.clone(),
                package_json: package_json.clone(),
            }),
            CodeSourceSpec::Archive { archive_path } => {
                let path = if archive_path.is_absolute() {
                    archive_path.clone()
                } else {
                    workspace.join(archive_path)
                };
                let bytes = tokio::fs::read(&path).await.map_err(|err| {
                    StepError::new(
                        "FLW-CODE-001",
                        format!("failed to read code archive {}: {}", path.display(), err),
                    )
                })?;
                Ok(CodeSource::Archive { bytes })
            }
        }
    }
}

/// Executes CODE steps: build if needed, then run, all in one leased box.
pub struct CodeStepRunner {
    pool: SandboxPool,
    builder: CodeBuilder,
    cache: Arc<ArtifactCache>,
    config: CodeConfig,
}

impl CodeStepRunner {
    pub fn new(
        pool: SandboxPool,
        builder: CodeBuilder,
        cache: Arc<ArtifactCache>,
        config: CodeConfig,
    ) -> Self {
        Self {
            pool,
            builder,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub async fn execute(
        &self,
        artifact_id: &str,
        source: &CodeSource,
        input: &Value,
    ) -> Result<Value, StepError> {
        let fingerprint = source.fingerprint();
        let mut lease = self.pool.checkout().await?;

        let artifact: Arc<BuildArtifact> = match self.cache.get(artifact_id, &fingerprint) {
            Some(artifact) => artifact,
            None => {
                let built = Arc::new(self.builder.build_in(&mut lease, source).await?);
                self.cache.insert(artifact_id, Arc::clone(&built));
                self.pool.clean_and_init(&mut lease).await?;
                built
            }
        };

        let dir = lease.scratch_dir().to_path_buf();
        let write = |name: &str, bytes: Vec<u8>| {
            let path = dir.join(name);
            async move {
                tokio::fs::write(&path, bytes).await.map_err(|err| {
                    StepError::new(
                        "FLW-CODE-004",
                        format!("failed to stage {}: {}", path.display(), err),
                    )
                })
            }
        };
        write(ARTIFACT_FILE, artifact.bytes.clone()).await?;
        write(INPUT_FILE, serde_json::to_vec(input).unwrap_or_default()).await?;
        write(RUNNER_FILE, RUNNER_SCRIPT.as_bytes().to_vec()).await?;

        let limits = self.pool.limits().clone().with_wall_time(self.config.timeout());
        let outcome = self
            .pool
            .execute(&lease, &SandboxCommand::new(&self.config.runtime_command, limits))
            .await?;
        tracing::debug!(
            box_id = lease.id(),
            artifact_id,
            status = ?outcome.status,
            duration_ms = outcome.duration_ms,
            "code step finished"
        );

        let raw = match tokio::fs::read(dir.join(OUTPUT_FILE)).await {
            Ok(raw) => raw,
            Err(_) => {
                let message = match outcome.status {
                    SandboxStatus::TimedOut => format!(
                        "code step timed out after {}s",
                        self.config.timeout_seconds
                    ),
                    _ => format!(
                        "code step produced no output (exit code {:?})",
                        outcome.exit_code
                    ),
                };
                return Err(StepError::new("FLW-CODE-003", message).with_stderr(outcome.stderr));
            }
        };

        match serde_json::from_slice::<RunnerResult>(&raw) {
            Ok(RunnerResult::Ok { output }) => Ok(output),
            Ok(RunnerResult::Error { error }) => {
                Err(StepError::new("FLW-CODE-002", error.message).with_stderr(outcome.stderr))
            }
            Err(err) => Err(StepError::new(
                "FLW-CODE-003",
                format!("code step output is not valid: {}", err),
            )
            .with_stderr(outcome.stderr)),
        }
    }
}
