use crate::logging::context::ExecutionContext;
use crate::logging::layers::file::BoxedLayer;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Console sink. Flow reports go to stdout, so logs default to stderr.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleOutput {
    Stdout,
    #[default]
    Stderr,
    None,
}

impl fmt::Display for ConsoleOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleOutput::Stdout => "stdout",
            ConsoleOutput::Stderr => "stderr",
            ConsoleOutput::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for ConsoleOutput {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdout" => Ok(ConsoleOutput::Stdout),
            "stderr" => Ok(ConsoleOutput::Stderr),
            "none" => Ok(ConsoleOutput::None),
            other => Err(format!(
                "unknown console output '{}' (expected stdout, stderr or none)",
                other
            )),
        }
    }
}

/// An explicit setting wins; otherwise workers stay quiet on the console.
pub fn select_console_output(
    context: ExecutionContext,
    configured: Option<ConsoleOutput>,
) -> ConsoleOutput {
    configured.unwrap_or(match context {
        ExecutionContext::LocalDev => ConsoleOutput::Stderr,
        ExecutionContext::Worker => ConsoleOutput::None,
    })
}

/// Compact human-readable lines, or nothing for `ConsoleOutput::None`.
pub fn console_layer<S>(output: ConsoleOutput) -> Option<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = tracing_subscriber::fmt::layer().compact().with_target(false);
    match output {
        ConsoleOutput::Stdout => Some(base.with_writer(io::stdout).boxed()),
        ConsoleOutput::Stderr => Some(base.with_writer(io::stderr).boxed()),
        ConsoleOutput::None => None,
    }
}
