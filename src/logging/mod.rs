//! Tracing setup for the CLI: an env filter, an optional log file and a
//! context-dependent console sink.

pub mod config;
pub mod context;
pub mod layers;

pub use config::{LogFormat, LoggingConfig};
pub use context::{detect_context, ExecutionContext};
pub use layers::console::ConsoleOutput;

use crate::cli::Command;
use crate::logging::layers::{console, file};
use crate::Result;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Registry;

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Flushes the file writer on drop; hold it for the life of the command.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    console_output: ConsoleOutput,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    pub fn console_output(&self) -> ConsoleOutput {
        self.console_output
    }

    /// None when file logging is disabled.
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// Install the global subscriber for `command`. `RUST_LOG` beats `logging.level`.
pub fn init(command: &Command) -> Result<LoggingGuard> {
    if LOGGER_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(anyhow!("logging already initialized"));
    }

    let context = detect_context(command);
    let workspace = command_workspace(command);
    let config = LoggingConfig::load(workspace.as_deref())?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("failed to build log filter")?;

    let mut layers: Vec<file::BoxedLayer<Registry>> = Vec::new();
    let mut file_guard = None;
    let mut log_dir = None;
    if config.file {
        let dir = file::log_dir(&config, workspace.as_deref())?;
        let (layer, guard) = file::file_layer(&dir, config.format, context)?;
        layers.push(layer);
        file_guard = Some(guard);
        log_dir = Some(dir);
    }
    let console_output = console::select_console_output(context, config.console);
    layers.extend(console::console_layer(console_output));

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        console_output,
        log_dir,
    })
}

/// `--workspace` when the command takes one, else the current directory.
fn command_workspace(command: &Command) -> Option<PathBuf> {
    let explicit = match command {
        Command::Run(args) => args.workspace.clone(),
        Command::Build(args) => args.workspace.clone(),
        Command::Worker(args) => args.workspace.clone(),
        Command::Resolve(_) => None,
    };
    explicit.or_else(|| std::env::current_dir().ok())
}
