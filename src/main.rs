mod backend;
mod breaker;
mod cli;
mod config;
mod context;
mod error;
mod gitops;
mod observe;
mod pathsafe;
mod permissions;
mod sanitize;
mod selector;
mod server;
#[cfg(test)]
mod testutil;
mod workflow;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit codes: 0 clean shutdown, 1 initialization failure, 2 unrecoverable
/// crash while serving.
const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_CRASH: u8 = 2;

/// Wire the engine: config store, env gates, persistent stores, dispatcher.
fn initialize(args: &cli::Cli) -> anyhow::Result<Arc<context::EngineContext>> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(config::data_dir_from_env);
    let gates = config::EnvGates::from_env();

    if gates.production && (gates.allow_permission_bypass || gates.allow_auto_approve) {
        warn!("permission bypass opt-ins are set but ignored: production mode");
    }

    let engine = context::EngineContext::initialize(config_path.clone(), data_dir, gates)?;
    info!(
        config_path = %config_path.display(),
        backends = engine.executors.names().len(),
        "unitai initialized"
    );
    Ok(engine)
}

/// Serve MCP over stdio until the peer disconnects or a signal arrives.
async fn run(engine: Arc<context::EngineContext>) -> anyhow::Result<()> {
    let server = server::UnitaiServer::new(engine);
    info!("starting MCP stdio server");
    let service = server.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                result?;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    info!("shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();

    // Logs go to stderr so the stdio transport stays clean.
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let engine = match initialize(&args) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "initialization failed");
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    match run(engine).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server crashed");
            ExitCode::from(EXIT_CRASH)
        }
    }
}
