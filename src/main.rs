use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use nodehub::protocol::Params;
use nodehub::{Config, Dispatcher, HealthMonitor, HealthOutcome, Registry, Supervisor};

/// Nodehub - launch, call and monitor external node processes
#[derive(Parser)]
#[command(name = "nodehub", version, about)]
struct Cli {
    /// Directory to scan for node manifests (repeatable; replaces the
    /// directories from the environment and config file)
    #[arg(long = "manifest-dir", global = true)]
    manifest_dirs: Vec<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered nodes
    List {
        /// Show only this node
        #[arg(long)]
        node: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Launch a node, call one method, and shut it down
    Run {
        /// Node id
        #[arg(long)]
        node: String,
        /// Method to call
        #[arg(long, default_value = "node.execute")]
        method: String,
        /// Call timeout in milliseconds (default from config)
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// `key=value` pairs (values parsed as JSON, else string) or one
        /// JSON object
        #[arg(last = true)]
        params: Vec<String>,
    },
    /// Launch nodes, run one health round, and report
    Status {
        /// Check only this node
        #[arg(long)]
        node: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Launch every node and monitor health until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,nodehub=info",
        1 => "info,nodehub=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load()?;
    if !cli.manifest_dirs.is_empty() {
        config = config.with_manifest_dirs(cli.manifest_dirs);
    }
    tracing::debug!(?config, "loaded configuration");

    let registry = Registry::from_dirs(&config.manifest_dirs)?;
    tracing::debug!(nodes = registry.len(), "loaded node registry");

    match cli.command {
        Command::List { node, json } => cmd_list(&config, &registry, node.as_deref(), json),
        Command::Run {
            node,
            method,
            timeout_ms,
            params,
        } => {
            let params = parse_params(&params)?;
            let timeout = timeout_ms.map(Duration::from_millis);
            cmd_run(&config, registry, &node, &method, timeout, params).await
        }
        Command::Status { node, json } => cmd_status(&config, registry, node, json).await,
        Command::Serve => cmd_serve(&config, registry).await,
    }
}

/// Print registered nodes
fn cmd_list(
    config: &Config,
    registry: &Registry,
    node: Option<&str>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let nodes = match node {
        Some(id) => vec![
            registry
                .lookup(id)
                .ok_or_else(|| anyhow::anyhow!("node '{id}' is not registered"))?,
        ],
        None => registry.list(),
    };

    if json {
        let entries: Vec<Value> = nodes
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "name": d.display_name(),
                    "version": d.version,
                    "description": d.description,
                    "executable": d.executable_path,
                    "protocol_version": d.protocol_version,
                    "socket_path": d.socket_path(&config.runtime_dir),
                    "methods": d.methods,
                    "manifest": d.manifest_path,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(ExitCode::SUCCESS);
    }

    if nodes.is_empty() {
        println!("No nodes found in:");
        for dir in &config.manifest_dirs {
            println!("  {}", dir.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<20} {:<20} {:<10} METHODS", "ID", "NAME", "VERSION");
    for d in nodes {
        let methods: Vec<&str> = d.methods.iter().map(String::as_str).collect();
        println!(
            "{:<20} {:<20} {:<10} {}",
            d.id,
            d.display_name(),
            d.version.as_deref().unwrap_or("-"),
            methods.join(", ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Launch one node, call a method, print the result
async fn cmd_run(
    config: &Config,
    registry: Registry,
    node_id: &str,
    method: &str,
    timeout: Option<Duration>,
    params: Params,
) -> anyhow::Result<ExitCode> {
    let supervisor = Supervisor::from_config(Arc::new(registry), config);
    let grace = config.supervisor.shutdown_grace;

    if let Err(e) = supervisor.launch_id(node_id).await {
        eprintln!("node {node_id}: launch_failed: {e}");
        supervisor.shutdown_all(grace).await;
        return Ok(ExitCode::FAILURE);
    }

    let dispatcher = Dispatcher::from_config(supervisor.clone(), config);
    let timeout = timeout.unwrap_or_else(|| dispatcher.default_timeout());
    let result = dispatcher.call(node_id, method, params, timeout).await;

    supervisor.shutdown_all(grace).await;

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("node {}: {}: {e}", e.node_id(), e.kind());
            Ok(ExitCode::FAILURE)
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusRow {
    node_id: String,
    state: String,
    healthy: bool,
    detail: String,
}

/// Launch nodes, run one health round, and report
async fn cmd_status(
    config: &Config,
    registry: Registry,
    node: Option<String>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let ids: Vec<String> = match node {
        Some(id) => {
            if registry.lookup(&id).is_none() {
                anyhow::bail!("node '{id}' is not registered");
            }
            vec![id]
        }
        None => registry.list().iter().map(|d| d.id.clone()).collect(),
    };

    let supervisor = Supervisor::from_config(Arc::new(registry), config);
    let launches =
        futures::future::join_all(ids.iter().map(|id| supervisor.launch_id(id))).await;

    let mut rows = Vec::new();
    for (id, launch) in ids.iter().zip(launches) {
        if let Err(e) = launch {
            rows.push(StatusRow {
                node_id: id.clone(),
                state: supervisor
                    .get(id)
                    .map_or_else(|| "not launched".to_string(), |n| n.state.to_string()),
                healthy: false,
                detail: e.to_string(),
            });
        }
    }

    let mut monitor = HealthMonitor::new(supervisor.clone(), config.health);
    for report in monitor.check_once().await {
        let detail = match (&report.outcome, &report.detail) {
            (HealthOutcome::Failed(reason), _) => reason.clone(),
            (HealthOutcome::Healthy, Some(body)) => body
                .get("uptime_secs")
                .and_then(Value::as_u64)
                .map_or_else(String::new, |secs| format!("up {secs}s")),
            (HealthOutcome::Healthy, None) => String::new(),
        };
        rows.push(StatusRow {
            node_id: report.node_id,
            state: report.state.to_string(),
            healthy: report.outcome.is_healthy(),
            detail,
        });
    }

    supervisor
        .shutdown_all(config.supervisor.shutdown_grace)
        .await;

    rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    let all_healthy = rows.iter().all(|row| row.healthy);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{:<20} {:<12} {:<8} DETAIL", "ID", "STATE", "HEALTH");
        for row in &rows {
            println!(
                "{:<20} {:<12} {:<8} {}",
                row.node_id,
                row.state,
                if row.healthy { "ok" } else { "FAIL" },
                row.detail
            );
        }
    }

    Ok(if all_healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Launch every node and monitor health until SIGINT or SIGTERM
async fn cmd_serve(config: &Config, registry: Registry) -> anyhow::Result<ExitCode> {
    let supervisor = Supervisor::from_config(Arc::new(registry), config);

    let mut failed = 0_usize;
    for (node_id, result) in supervisor.launch_all().await {
        match result {
            Ok(node) => tracing::info!(node_id = %node_id, pid = node.pid, "node ready"),
            Err(e) => {
                tracing::error!(node_id = %node_id, error = %e, "node failed to launch");
                failed += 1;
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = HealthMonitor::new(supervisor.clone(), config.health).spawn(shutdown_rx);

    tracing::info!(
        nodes = supervisor.list().len(),
        failed,
        "nodehub ready"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }

    tracing::info!("shutting down");
    shutdown_tx.send_replace(true);
    monitor.await?;

    for (node_id, result) in supervisor
        .shutdown_all(config.supervisor.shutdown_grace)
        .await
    {
        if let Err(e) = result {
            tracing::warn!(node_id = %node_id, error = %e, "failed to stop node");
        }
    }

    let stats = supervisor.stats();
    tracing::info!(
        started = stats.total_started,
        crashed = stats.total_crashed,
        restarts = stats.total_restarts,
        stopped = stats.total_stopped,
        "nodehub stopped"
    );

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Parse trailing `run` arguments into call params
fn parse_params(args: &[String]) -> anyhow::Result<Params> {
    if args.len() == 1 && args[0].trim_start().starts_with('{') {
        return match serde_json::from_str(&args[0])? {
            Value::Object(params) => Ok(params),
            _ => anyhow::bail!("params must be a JSON object"),
        };
    }

    let mut params = Params::new();
    for arg in args {
        let (key, raw) = arg
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{arg}'"))?;
        if key.is_empty() {
            anyhow::bail!("empty key in '{arg}'");
        }
        let value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}
