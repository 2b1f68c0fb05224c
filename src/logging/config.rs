use crate::core::config::loader::CONFIG_FILE_NAME;
use crate::logging::layers::console::ConsoleOutput;
use crate::Result;
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing_subscriber::filter::Directive;

/// Line format for the log file.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}' (expected text or json)", other)),
        }
    }
}

/// The `[logging]` table of flowrun.toml. Other tables in the file are ignored here.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset, e.g. `info` or `flowrun=debug`.
    pub level: String,
    /// Relative paths are anchored at the workspace.
    pub dir: Option<PathBuf>,
    pub file: bool,
    pub format: LogFormat,
    /// Unset means the execution context decides.
    pub console: Option<ConsoleOutput>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: true,
            format: LogFormat::Text,
            console: None,
        }
    }
}

#[derive(Deserialize, Default)]
struct ConfigDocument {
    #[serde(default)]
    logging: LoggingConfig,
}

impl LoggingConfig {
    /// Defaults, then `<workspace>/flowrun.toml`, then `FLOWRUN_LOG_*` variables.
    pub fn load(workspace_root: Option<&Path>) -> Result<Self> {
        let mut config = match workspace_root.map(|root| root.join(CONFIG_FILE_NAME)) {
            Some(path) if path.is_file() => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str::<ConfigDocument>(&content)
                    .with_context(|| format!("invalid [logging] table in {}", path.display()))?
                    .logging
            }
            _ => LoggingConfig::default(),
        };
        config.apply_env()?;
        Directive::from_str(&config.level)
            .map_err(|_| anyhow!("logging.level '{}' is not a valid filter directive", config.level))?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(level) = non_empty_var("FLOWRUN_LOG_LEVEL") {
            self.level = level;
        }
        if let Some(dir) = non_empty_var("FLOWRUN_LOG_DIR") {
            self.dir = Some(PathBuf::from(dir));
        }
        if let Some(console) = non_empty_var("FLOWRUN_LOG_CONSOLE") {
            self.console = Some(console.parse().map_err(|err: String| anyhow!(err))?);
        }
        if let Some(format) = non_empty_var("FLOWRUN_LOG_FORMAT") {
            self.format = format.parse().map_err(|err: String| anyhow!(err))?;
        }
        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
