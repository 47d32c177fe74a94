//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use chrono::{DateTime, Utc};
use starload_core::config::{CredentialBackend, StarloadConfig, load_config};
use starload_core::credentials::{
    CredentialProvider, Credentials, EnvCredentialProvider, KeyringCredentialProvider,
    StaticCredentialProvider,
};
use starload_core::pipeline::{
    PipelineDefinition, PipelineExecutor, RunContext, RunState, TaskGraph, all_builtins,
    get_builtin, list_builtin_names, parse_pipeline, validate_pipeline,
};
use starload_core::ports::DryRunWarehouse;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Plan { pipeline } => handle_plan(&pipeline, workspace, config_file),
        Commands::Validate { pipeline } => handle_validate(&pipeline, workspace, config_file),
        Commands::Run {
            pipeline,
            dry_run,
            logical_date,
            with_credentials,
            json,
        } => {
            let options = RunOptions {
                dry_run,
                logical_date,
                with_credentials,
                json,
            };
            handle_run(&pipeline, options, workspace, config_file).await
        }
        Commands::Config { action } => handle_config(action, workspace, config_file),
        Commands::Pipelines => handle_pipelines(),
    }
}

struct RunOptions {
    dry_run: bool,
    logical_date: Option<String>,
    with_credentials: bool,
    json: bool,
}

/// Resolve a pipeline argument: an existing YAML file, otherwise a built-in name.
fn load_pipeline(pipeline: &str, workspace: &Path) -> anyhow::Result<PipelineDefinition> {
    let path = workspace.join(pipeline);
    let def = if path.is_file() {
        let yaml = std::fs::read_to_string(&path)?;
        parse_pipeline(&yaml)?
    } else {
        get_builtin(pipeline)?.ok_or_else(|| {
            anyhow::anyhow!(
                "Pipeline '{}' is neither a file nor a built-in (available: {})",
                pipeline,
                list_builtin_names().join(", ")
            )
        })?
    };
    validate_pipeline(&def)?;
    Ok(def)
}

fn build_graph(
    pipeline: &str,
    workspace: &Path,
    config: &StarloadConfig,
) -> anyhow::Result<(PipelineDefinition, TaskGraph)> {
    let def = load_pipeline(pipeline, workspace)?;
    let graph = TaskGraph::from_definition(&def, &config.retry.default_policy())?;
    Ok((def, graph))
}

fn handle_plan(pipeline: &str, workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(Some(workspace), config_file, None)?;
    let (def, graph) = build_graph(pipeline, workspace, &config)?;
    println!("{}", render_plan(&def, &graph));
    Ok(())
}

fn render_plan(def: &PipelineDefinition, graph: &TaskGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Pipeline: {} ({} tasks)", def.name, def.tasks.len());
    if !def.description.is_empty() {
        let _ = writeln!(out, "  {}", def.description);
    }
    for (i, level) in graph.levels().iter().enumerate() {
        let names: Vec<String> = level
            .iter()
            .map(|name| match graph.task(name) {
                Some(task) => match task.operation.target_table() {
                    Some(table) => format!("{} [{} -> {}]", name, task.operation.kind(), table),
                    None => format!("{} [{}]", name, task.operation.kind()),
                },
                None => name.to_string(),
            })
            .collect();
        let _ = writeln!(out, "  {}. {}", i + 1, names.join(", "));
    }
    out
}

fn handle_validate(
    pipeline: &str,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(Some(workspace), config_file, None)?;
    let (def, graph) = build_graph(pipeline, workspace, &config)?;
    println!(
        "Pipeline '{}' is valid: {} tasks, {} edges",
        def.name,
        def.tasks.len(),
        graph.edges().len()
    );
    Ok(())
}

fn credential_provider(config: &StarloadConfig) -> Arc<dyn CredentialProvider> {
    match config.source.credential_backend {
        CredentialBackend::Env => Arc::new(EnvCredentialProvider::new()),
        CredentialBackend::Keyring => Arc::new(KeyringCredentialProvider::new()),
    }
}

async fn handle_run(
    pipeline: &str,
    options: RunOptions,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    if !options.dry_run {
        anyhow::bail!(
            "No warehouse connector is linked into this binary. \
             Use --dry-run to print the statements a run would issue."
        );
    }

    let config = load_config(Some(workspace), config_file, None)?;
    let (def, graph) = build_graph(pipeline, workspace, &config)?;

    let logical_date = match &options.logical_date {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| anyhow::anyhow!("Invalid --logical-date '{}': {}", s, e))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let credentials: Arc<dyn CredentialProvider> = if options.with_credentials {
        tracing::info!(backend = %config.source.credential_backend, "Resolving source credentials");
        credential_provider(&config)
    } else {
        Arc::new(
            StaticCredentialProvider::new()
                .with_fallback(Credentials::new("DRY-RUN-ACCESS-KEY", "DRY-RUN-SECRET-KEY")),
        )
    };

    let warehouse = Arc::new(DryRunWarehouse::new());
    let executor = PipelineExecutor::new(warehouse, credentials, config);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    let signal_listener = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let state = executor
        .run_with_cancellation(&graph, RunContext::new(logical_date), &def.name, cancel)
        .await;
    signal_listener.abort();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print!("{}", render_summary(&state));
    }

    state.into_result()?;
    Ok(())
}

fn render_summary(state: &RunState) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Run {} of '{}' for {}: {}{}",
        state.run_id,
        state.pipeline,
        state.logical_date.to_rfc3339(),
        state.status,
        if state.cancelled { " (cancelled)" } else { "" }
    );
    for (name, record) in &state.tasks {
        let _ = write!(
            out,
            "  {:<24} {:<16} attempts={}",
            name,
            record.status.to_string(),
            record.attempts
        );
        if let Some(err) = &record.error {
            let _ = write!(out, "  error: {}", err);
        }
        out.push('\n');
        if let Some(report) = &record.quality {
            for result in &report.results {
                let _ = writeln!(out, "      {}", result);
            }
        }
    }
    out
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".starload");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&StarloadConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file, None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn handle_pipelines() -> anyhow::Result<()> {
    println!("Available pipelines:");
    for def in all_builtins()? {
        println!("  {} - {}", def.name, def.description);
    }
    Ok(())
}
