use crate::{
    cli::args::{BuildArgs, ResolveArgs, RunArgs, WorkerArgs},
    core::{
        builder::{CodeBuilder, CodeSource},
        flow::{
            load_flow, state::redact_value, ExecutionState, FlowRunner, PieceRegistry,
            RunOptions, RuntimeServices, StepRecord,
        },
        jobs::{InMemoryJobQueue, JobHandlerRegistry, JobQueue, PruneArtifactCacheJob, SystemJobScheduler},
        sandbox::SandboxPool,
        ConfigLoader, RunStatus,
    },
    Result,
};
use anyhow::{anyhow, Context};
use serde_json::{Map, Value};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn workspace_or_cwd(workspace: Option<PathBuf>) -> Result<PathBuf> {
    match workspace {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("failed to read current directory"),
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// `KEY=VALUE` pairs; values that parse as JSON keep their type.
fn parse_config_overrides(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut overrides = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("config override '{}' must look like KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        overrides.insert(key.trim().to_string(), value);
    }
    Ok(overrides)
}

pub async fn run(args: RunArgs) -> Result<()> {
    let workspace = workspace_or_cwd(args.workspace)?;
    let config = ConfigLoader::load_from_workspace(&workspace)?;
    let redact_keys = config.run.redact_keys.clone();
    let flow = Arc::new(load_flow(&args.flow)?);
    let payload = match &args.trigger {
        Some(path) => read_json(path)?,
        None => Value::Object(Map::new()),
    };

    let services = RuntimeServices::from_config(&workspace, config, PieceRegistry::default())?;
    let runner = FlowRunner::new(services);
    let options = RunOptions {
        max_time: args.max_time,
        config_overrides: parse_config_overrides(&args.configs)?,
        ..RunOptions::default()
    };
    let handle = runner.spawn(Arc::clone(&flow), payload, options);
    let cancel = handle.cancel_token();

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });
    let result = handle.join().await?;
    interrupt.abort();

    let mut report = serde_json::to_value(&result)?;
    redact_value(&mut report, &redact_keys);
    println!("{}", serde_json::to_string_pretty(&report)?);

    match result.status {
        RunStatus::Succeeded => Ok(()),
        status => {
            let detail = result
                .failure
                .map(|failure| format!(" at step '{}': {}", failure.step, failure.message))
                .unwrap_or_default();
            Err(anyhow!("run {} finished {}{}", result.run_id, status, detail))
        }
    }
}

/// Build an execution state from `{configs, trigger, <step>: output, ...}`.
fn state_from_value(value: Value) -> Result<ExecutionState> {
    let Value::Object(mut map) = value else {
        return Err(anyhow!("state file must contain a JSON object"));
    };
    let configs = match map.remove("configs") {
        Some(Value::Object(configs)) => configs,
        Some(_) => return Err(anyhow!("state.configs must be an object")),
        None => Map::new(),
    };
    let mut state = ExecutionState::new(configs);
    if let Some(trigger) = map.remove("trigger") {
        state.bind_trigger("trigger", trigger)?;
    }
    for (name, output) in map {
        state.insert(StepRecord::success(name, output, 0))?;
    }
    Ok(state)
}

pub async fn resolve(args: ResolveArgs) -> Result<()> {
    let state = state_from_value(read_json(&args.state)?)?;
    let template =
        serde_json::from_str(&args.template).unwrap_or_else(|_| Value::String(args.template.clone()));
    let resolved = crate::core::flow::resolver::resolve(&template, &state);
    tracing::debug!(state = %state.fingerprint(), "template resolved");
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist"];

fn add_dir_to_zip(
    writer: &mut zip::ZipWriter<Cursor<Vec<u8>>>,
    root: &Path,
    dir: &Path,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let relative = path.strip_prefix(root)?.to_string_lossy().replace('\\', "/");
        if path.is_dir() {
            if SKIPPED_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }
            add_dir_to_zip(writer, root, &path)?;
        } else {
            writer.start_file(relative, zip::write::FileOptions::default())?;
            writer.write_all(&std::fs::read(&path)?)?;
        }
    }
    Ok(())
}

fn load_code_source(source: &Path) -> Result<CodeSource> {
    if source.is_dir() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        add_dir_to_zip(&mut writer, source, source)?;
        let bytes = writer.finish()?.into_inner();
        return Ok(CodeSource::Archive { bytes });
    }
    let bytes =
        std::fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
    Ok(CodeSource::Archive { bytes })
}

pub async fn build(args: BuildArgs) -> Result<()> {
    let workspace = workspace_or_cwd(args.workspace)?;
    let config = ConfigLoader::load_from_workspace(&workspace)?;
    let source = load_code_source(&args.source)?;
    let pool = SandboxPool::from_config(&config.sandbox, &workspace)?;
    let builder = CodeBuilder::new(pool, config.builder.clone());

    let artifact = builder.build(&source).await?;
    if let Some(parent) = args.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&args.out, &artifact.bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    if artifact.fallback {
        eprintln!("{}", artifact.build_log);
        return Err(anyhow!(
            "build failed; wrote fallback artifact to {}",
            args.out.display()
        ));
    }
    println!(
        "built {} ({} bytes, fingerprint {})",
        args.out.display(),
        artifact.bytes.len(),
        artifact.fingerprint
    );
    Ok(())
}

pub async fn worker(args: WorkerArgs) -> Result<()> {
    let workspace = workspace_or_cwd(args.workspace)?;
    let config = ConfigLoader::load_from_workspace(&workspace)?;
    let services = RuntimeServices::from_config(&workspace, config.clone(), PieceRegistry::default())?;

    let mut handlers = JobHandlerRegistry::builder();
    handlers.register(PruneArtifactCacheJob::new(
        Arc::clone(services.code.cache()),
        PruneArtifactCacheJob::DEFAULT_MAX_ENTRIES,
    ))?;
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::from_config(&config.jobs));
    let scheduler = Arc::new(SystemJobScheduler::new(queue, handlers.build(), config.jobs.clone()));
    let next = scheduler
        .upsert_job(PruneArtifactCacheJob::job(&args.prune_cron)?)
        .await?;
    tracing::info!(next_run_at = %next, "artifact cache pruning scheduled");

    let token = CancellationToken::new();
    let dispatcher = scheduler.start_completion_dispatcher(token.clone());
    let poller = Arc::clone(&scheduler).start(token.clone());
    eprintln!("flowrun worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    token.cancel();
    poller.await?;
    dispatcher.await?;
    Ok(())
}
