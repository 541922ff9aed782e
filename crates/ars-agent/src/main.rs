//! ars-agent: a generic worker that connects to the coordinator and serves
//! a couple of diagnostic task types.
//!
//! Usage:
//!   ars-agent [--config <path>] [--server-url <url>] [--agent-type <type>]
//!             [--capability <name>]... [--json-rpc] [--log-level <level>]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ars_agent::{
    handler_fn, typed_handler, AgentConfig, ConnectionManager, ConnectionState, TaskError,
    WebSocketDialer,
};
use ars_protocol::{AgentIdentity, AgentKind, WireForm};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ars-agent", about = "ARS worker agent")]
struct Cli {
    /// Path to a TOML config file (defaults to $CONFIG_DIR/ars/agent.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coordinator WebSocket URL.
    #[arg(long)]
    server_url: Option<String>,

    /// Agent type, e.g. `executor` or `research-manager`.
    #[arg(long)]
    agent_type: Option<AgentKind>,

    /// Capability advertised at registration. Repeatable.
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Speak JSON-RPC 2.0 instead of the type-tagged form.
    #[arg(long)]
    json_rpc: bool,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Deserialize)]
struct SleepParams {
    #[serde(default)]
    millis: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AgentConfig::load(cli.config.as_deref()).context("loading agent config")?;
    if let Some(url) = cli.server_url {
        config.server.url = url;
    }
    if let Some(kind) = cli.agent_type {
        config.agent.kind = kind;
    }
    if !cli.capabilities.is_empty() {
        config.agent.capabilities = cli.capabilities;
    }
    if cli.json_rpc {
        config.server.wire_form = WireForm::JsonRpc;
    }
    config.validate()?;

    let mut identity = AgentIdentity::new(config.agent.kind, config.agent.capabilities.clone());
    if let Some(service) = config.agent.service.clone() {
        identity = identity.with_service(service);
    }
    tracing::info!(agent_id = %identity.agent_id, server = %config.server.url, "Starting agent");

    let dialer = Arc::new(WebSocketDialer::new(config.server.url.clone()));
    let manager = ConnectionManager::new(identity, config, dialer).await;

    manager
        .register_task_handler("echo", handler_fn(|payload| async move { Ok(payload) }))
        .await;
    manager
        .register_task_handler(
            "sleep",
            typed_handler(|p: SleepParams| async move {
                tokio::time::sleep(Duration::from_millis(p.millis)).await;
                Ok::<_, TaskError>(json!({"slept_ms": p.millis}))
            }),
        )
        .await;

    manager.connect().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
        state = manager.wait_terminal() => {
            if state == ConnectionState::Failed {
                manager.disconnect().await;
                anyhow::bail!("connection to coordinator failed");
            }
        }
    }

    manager.disconnect().await;
    Ok(())
}
