use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Flow definition file (.yaml, .yml or .json)
    #[arg(value_name = "FLOW")]
    pub flow: PathBuf,

    /// JSON file holding the trigger payload (default: empty object)
    #[arg(long, value_name = "FILE")]
    pub trigger: Option<PathBuf>,

    /// Workspace holding flowrun.toml and .flowrun state (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Whole-run time limit such as 90s or 10m (default: run.max_time_seconds)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub max_time: Option<Duration>,

    /// Override a flow config value; VALUE is parsed as JSON, else taken as text
    #[arg(long = "config", value_name = "KEY=VALUE")]
    pub configs: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Template to resolve; parsed as JSON when possible, else treated as a string
    #[arg(value_name = "TEMPLATE")]
    pub template: String,

    /// JSON object with `configs`, `trigger` and step outputs keyed by step name
    #[arg(long, value_name = "FILE")]
    pub state: PathBuf,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Directory with package.json and index.js/index.ts, or a zip of one
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Where to write the bundled artifact
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,

    /// Workspace holding flowrun.toml (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Workspace holding flowrun.toml (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Cron expression for artifact cache pruning
    #[arg(long, value_name = "CRON", default_value = "*/15 * * * *")]
    pub prune_cron: String,
}
