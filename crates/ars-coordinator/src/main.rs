//! ars-coordinator: accepts agents over WebSocket and fans out tasks read
//! from stdin, one JSON object per line:
//!
//! ```text
//! {"task_id": "lit-1", "action": "search", "payload": {"queries": ["..."]}, "parallelism": 3}
//! ```
//!
//! Completed aggregates are printed to stdout as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use ars_coordinator::{Coordinator, CoordinatorConfig, CoordinatorEvent};
use ars_fanout::{FanoutOptions, FanoutStrategy, ParentTask};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ars-coordinator", about = "ARS coordinating server")]
struct Cli {
    /// Path to a TOML config file (defaults to $CONFIG_DIR/ars/coordinator.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:9100.
    #[arg(long)]
    bind: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

/// One line of stdin.
#[derive(Debug, Deserialize)]
struct Submission {
    #[serde(flatten)]
    task: ParentTask,
    parallelism: Option<usize>,
    strategy: Option<FanoutStrategy>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config =
        CoordinatorConfig::load(cli.config.as_deref()).context("loading coordinator config")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    config.validate()?;

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    let coordinator = Coordinator::new(config);

    tokio::spawn(Arc::clone(&coordinator).run_stale_sweep());
    tokio::spawn(print_aggregates(coordinator.subscribe()));
    let server = tokio::spawn(Arc::clone(&coordinator).serve(listener));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => submit_line(&coordinator, &line).await,
                None => {
                    // stdin closed; keep serving until interrupted.
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    server.abort();
    Ok(())
}

async fn submit_line(coordinator: &Coordinator, line: &str) {
    let submission: Submission = match serde_json::from_str(line) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed submission");
            return;
        }
    };
    let defaults = coordinator.config();
    let options = FanoutOptions::new(
        submission.parallelism.unwrap_or(defaults.default_parallelism),
        submission.strategy.unwrap_or(defaults.default_strategy),
    );
    match coordinator.submit(submission.task, None, Some(options)).await {
        Ok(report) => tracing::info!(
            parent_task_id = %report.parent_task_id,
            dispatched = report.dispatched.len(),
            undeliverable = report.undeliverable.len(),
            "Fan-out submitted"
        ),
        Err(e) => tracing::warn!(error = %e, "Submission rejected"),
    }
}

async fn print_aggregates(mut events: tokio::sync::broadcast::Receiver<CoordinatorEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(CoordinatorEvent::FanoutCompleted {
                parent_task_id,
                aggregate,
            }) => {
                println!(
                    "{}",
                    serde_json::json!({"parent_task_id": parent_task_id, "aggregate": aggregate})
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Aggregate printer lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}
