pub mod args;
pub mod commands;

pub use args::{BuildArgs, ResolveArgs, RunArgs, WorkerArgs};
use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
FLOW COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(version = crate::VERSION)]
#[command(about = "Flow execution runtime: step graphs, placeholders, sandboxed code and system jobs")]
#[command(help_template = HELP_TEMPLATE)]
#[command(
    after_long_help = "Typical flow: check templates with resolve, bundle code steps with build, execute flows with run, and keep a worker alive for system jobs."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Execute a flow once",
        long_about = "Run walks the flow from its trigger, resolving placeholders, running CODE steps in sandbox boxes and PIECE steps through registered connectors. Ctrl-C cancels the run.",
        after_help = "Example:\n    flowrun run flows/orders.yaml --trigger payload.json --max-time 5m"
    )]
    Run(RunArgs),
    #[command(
        about = "Resolve a placeholder template against a state file",
        long_about = "Resolve prints the result of substituting ${...} placeholders in TEMPLATE using the configs, trigger and step outputs from the state file.",
        after_help = "Example:\n    flowrun resolve '${configs.msg} ${trigger.name}' --state state.json"
    )]
    Resolve(ResolveArgs),
    #[command(
        about = "Bundle code-step sources into a single artifact",
        long_about = "Build installs dependencies and bundles the sources inside a sandbox box. A failed build still writes an artifact that throws the build log.",
        after_help = "Example:\n    flowrun build ./code-step --out dist/step.js"
    )]
    Build(BuildArgs),
    #[command(
        about = "Run the system job scheduler",
        long_about = "Worker polls the job queue, runs due regular and durable jobs, and dispatches completion callbacks until Ctrl-C.",
        after_help = "Example:\n    flowrun worker --workspace ./deploy"
    )]
    Worker(WorkerArgs),
}

pub async fn run(args: Args) -> crate::Result<()> {
    match args.command {
        Command::Run(run_args) => commands::run(run_args).await,
        Command::Resolve(resolve_args) => commands::resolve(resolve_args).await,
        Command::Build(build_args) => commands::build(build_args).await,
        Command::Worker(worker_args) => commands::worker(worker_args).await,
    }
}
