#![allow(clippy::result_large_err)]

pub mod bundler;
pub mod cache;

pub use cache::ArtifactCache;

use crate::core::config::BuilderConfig;
use crate::core::error::AppError;
use crate::core::sandbox::{SandboxCommand, SandboxLease, SandboxPool};
use crate::core::types::ErrorCategory;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::path::Path;

/// User code submitted for a CODE step.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeSource {
    /// A single `index.js` plus an optional manifest.
    Inline { code: String, package_json: Value },
    /// A zip holding the manifest and sources.
    Archive { bytes: Vec<u8> },
}

impl CodeSource {
    /// sha256 over the source; identical sources share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            CodeSource::Inline { code, package_json } => {
                hasher.update(b"inline\0");
                hasher.update(code.as_bytes());
                hasher.update(b"\0");
                hasher.update(package_json.to_string().as_bytes());
            }
            CodeSource::Archive { bytes } => {
                hasher.update(b"archive\0");
                hasher.update(bytes);
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Write the sources into `dir` and return the user manifest, if any.
    pub async fn materialize(&self, dir: &Path) -> Result<Value, AppError> {
        match self {
            CodeSource::Inline { code, package_json } => {
                tokio::fs::write(dir.join("index.js"), code).await?;
                Ok(package_json.clone())
            }
            CodeSource::Archive { bytes } => {
                let bytes = bytes.clone();
                let target = dir.to_path_buf();
                tokio::task::spawn_blocking(move || extract_archive(&bytes, &target))
                    .await
                    .map_err(|err| {
                        AppError::new(
                            ErrorCategory::InternalError,
                            format!("archive extraction task failed: {}", err),
                        )
                    })??;
                match tokio::fs::read_to_string(dir.join(bundler::MANIFEST_FILE)).await {
                    Ok(text) => serde_json::from_str(&text).map_err(|err| {
                        build_error("BLD-003", format!("invalid package.json: {}", err))
                    }),
                    Err(_) => Ok(Value::Null),
                }
            }
        }
    }
}

fn build_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::BuildError, message).with_code(code)
}

/// Unpack a zip into `target`, refusing entries that would land outside it.
pub fn extract_archive(bytes: &[u8], target: &Path) -> Result<usize, AppError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| build_error("BLD-001", format!("invalid code archive: {}", err)))?;
    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| build_error("BLD-001", format!("invalid code archive: {}", err)))?;
        let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            build_error(
                "BLD-002",
                format!("archive entry '{}' escapes the build directory", entry.name()),
            )
        })?;
        let path = target.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        std::fs::write(&path, contents)?;
        written += 1;
    }
    Ok(written)
}

/// Runnable single-file bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    pub bytes: Vec<u8>,
    pub fingerprint: String,
    /// True when the build failed and `bytes` throws the build log.
    pub fallback: bool,
    pub build_log: String,
}

/// Bundles user code inside sandbox boxes.
#[derive(Clone)]
pub struct CodeBuilder {
    pool: SandboxPool,
    config: BuilderConfig,
}

impl CodeBuilder {
    pub fn new(pool: SandboxPool, config: BuilderConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Build in a box of its own; the box is released however the build ends.
    pub async fn build(&self, source: &CodeSource) -> Result<BuildArtifact, AppError> {
        let mut lease = self.pool.obtain().await?;
        self.build_in(&mut lease, source).await
    }

    /// Build inside a box the caller already holds. The box is wiped first.
    pub async fn build_in(
        &self,
        lease: &mut SandboxLease,
        source: &CodeSource,
    ) -> Result<BuildArtifact, AppError> {
        let fingerprint = source.fingerprint();
        self.pool.clean_and_init(lease).await?;
        let dir = lease.scratch_dir().to_path_buf();
        tracing::info!(box_id = lease.id(), fingerprint = %fingerprint, "building code artifact");

        let manifest = source.materialize(&dir).await?;
        let entry = bundler::detect_entry(&dir);
        tokio::fs::write(
            dir.join(bundler::WEBPACK_CONFIG_FILE),
            bundler::webpack_config(entry, &self.config.output_file),
        )
        .await?;
        let manifest = bundler::prepare_manifest(&manifest, entry.ends_with(".ts"));
        tokio::fs::write(
            dir.join(bundler::MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        let limits = self.pool.limits().clone().with_wall_time(self.config.timeout());
        let mut log = String::new();

        let install = self
            .pool
            .execute(lease, &SandboxCommand::new(&self.config.install_command, limits.clone()))
            .await?;
        append_phase(&mut log, "install", &install.log());

        if install.is_success() {
            let build = self
                .pool
                .execute(lease, &SandboxCommand::new(&self.config.build_command, limits))
                .await?;
            append_phase(&mut log, "build", &build.log());
        } else {
            tracing::warn!(box_id = lease.id(), status = ?install.status, "dependency install failed");
        }

        let output = dir.join(&self.config.output_file);
        match tokio::fs::read(&output).await {
            Ok(bytes) => Ok(BuildArtifact {
                bytes,
                fingerprint,
                fallback: false,
                build_log: log,
            }),
            Err(_) => {
                tracing::warn!(
                    box_id = lease.id(),
                    output = %output.display(),
                    "bundle missing, using fallback artifact"
                );
                Ok(BuildArtifact {
                    bytes: bundler::fallback_artifact(&log),
                    fingerprint,
                    fallback: true,
                    build_log: log,
                })
            }
        }
    }
}

fn append_phase(log: &mut String, phase: &str, output: &str) {
    if !log.is_empty() {
        log.push('\n');
    }
    log.push_str(&format!("[{}]", phase));
    if !output.is_empty() {
        log.push('\n');
        log.push_str(output);
    }
}
