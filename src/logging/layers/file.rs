use crate::logging::config::{LogFormat, LoggingConfig};
use crate::logging::context::ExecutionContext;
use crate::Result;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

pub const LOG_FILE_NAME: &str = "flowrun.log";

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Directory holding `flowrun.log`: `logging.dir`, else `<workspace>/.flowrun/logs`,
/// else `~/.flowrun/logs`. A relative `dir` must stay inside the workspace.
pub fn log_dir(config: &LoggingConfig, workspace_root: Option<&Path>) -> Result<PathBuf> {
    let anchor = match workspace_root {
        Some(root) => root.to_path_buf(),
        None => dirs_next::home_dir().ok_or_else(|| anyhow!("$HOME directory unavailable"))?,
    };
    let Some(custom) = &config.dir else {
        return Ok(anchor.join(".flowrun").join("logs"));
    };
    if custom.is_absolute() {
        return Ok(custom.clone());
    }
    if custom
        .components()
        .any(|part| matches!(part, std::path::Component::ParentDir))
    {
        return Err(anyhow!(
            "logging.dir '{}' must not leave {}",
            custom.display(),
            anchor.display()
        ));
    }
    Ok(anchor.join(custom))
}

/// Workers roll the file daily; one-shot commands append to a single file.
pub fn file_layer<S>(
    dir: &Path,
    format: LogFormat,
    context: ExecutionContext,
) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let appender = match context {
        ExecutionContext::Worker => rolling::daily(dir, LOG_FILE_NAME),
        ExecutionContext::LocalDev => rolling::never(dir, LOG_FILE_NAME),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let layer = match format {
        LogFormat::Text => base.boxed(),
        LogFormat::Json => base.json().with_current_span(true).boxed(),
    };
    Ok((layer, guard))
}
