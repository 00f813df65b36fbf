//! Stub node that echoes `node.execute` params back
//!
//! Used by the integration tests and as a starting point for real nodes.
//! The flags make it misbehave in the ways the orchestrator must survive.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use nodehub::protocol::{Params, RpcError, codes};
use nodehub::runtime::{NodeHandler, NodeInfo, NodeServer, ServerHandle};
use nodehub::supervisor::NODE_ID_ENV;

/// Nodehub echo node
#[derive(Parser)]
#[command(name = "nodehub-echo", version, about)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Socket to listen on (passed by the supervisor)
    socket_path: PathBuf,

    /// Node id reported by node.info
    #[arg(long, env = NODE_ID_ENV, default_value = "echo")]
    id: String,

    /// Delay before answering node.execute
    #[arg(long, default_value = "0")]
    execute_delay_ms: u64,

    /// Acknowledge node.shutdown but keep running
    #[arg(long)]
    ignore_shutdown: bool,

    /// Keep running after SIGTERM
    #[arg(long)]
    ignore_sigterm: bool,

    /// Report "degraded" from node.health
    #[arg(long)]
    fail_health: bool,

    /// Never bind the socket
    #[arg(long)]
    no_bind: bool,

    /// Exit immediately with this code
    #[arg(long)]
    exit_code: Option<u8>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct EchoNode {
    id: String,
    execute_delay: Duration,
    ignore_shutdown: bool,
    fail_health: bool,
}

#[async_trait]
impl NodeHandler for EchoNode {
    fn info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.id.clone(),
            name: "Echo".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Echoes execute params back to the caller".to_string(),
            methods: [
                "node.info",
                "node.health",
                "node.execute",
                "node.validate",
                "node.shutdown",
                "echo.ping",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }

    async fn execute(&self, params: Params) -> Result<Value, RpcError> {
        if !self.execute_delay.is_zero() {
            tokio::time::sleep(self.execute_delay).await;
        }
        if params.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(RpcError::new(codes::EXECUTION_FAILED, "asked to fail"));
        }
        Ok(Value::Object(params))
    }

    async fn validate(&self, params: Params) -> Result<Value, RpcError> {
        let errors: Vec<String> = params
            .iter()
            .filter(|(_, value)| value.is_null())
            .map(|(key, _)| format!("{key} must not be null"))
            .collect();
        Ok(json!({ "valid": errors.is_empty(), "errors": errors }))
    }

    async fn health(&self) -> Result<Value, RpcError> {
        let status = if self.fail_health { "degraded" } else { "healthy" };
        Ok(json!({ "status": status }))
    }

    async fn call(&self, method: &str, params: Params) -> Result<Value, RpcError> {
        match method {
            "echo.ping" => Ok(json!({ "pong": true, "params": params })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn accepts_shutdown(&self) -> bool {
        !self.ignore_shutdown
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    if let Some(code) = cli.exit_code {
        tracing::info!(code, "exiting as asked");
        return ExitCode::from(code);
    }

    if cli.no_bind {
        tracing::info!("not binding a socket");
        std::future::pending::<()>().await;
    }

    let server = NodeServer::new(
        cli.socket_path,
        EchoNode {
            id: cli.id,
            execute_delay: Duration::from_millis(cli.execute_delay_ms),
            ignore_shutdown: cli.ignore_shutdown,
            fail_health: cli.fail_health,
        },
    );

    if let Err(e) = watch_sigterm(server.handle(), cli.ignore_sigterm) {
        tracing::error!(error = %e, "failed to install SIGTERM handler");
        return ExitCode::FAILURE;
    }

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "node server failed");
            ExitCode::FAILURE
        }
    }
}

/// Stop the server on SIGTERM, or log and carry on when ignoring it
fn watch_sigterm(handle: ServerHandle, ignore: bool) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            if ignore {
                tracing::warn!("ignoring SIGTERM");
            } else {
                tracing::info!("received SIGTERM");
                handle.shutdown();
                break;
            }
        }
    });
    Ok(())
}
