//! Command-line entry for the gateway agent.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::broker::{Broker, BrokerError};
use crate::config::{self, ConfigError};
use crate::router::build_router;

#[derive(Parser, Debug)]
#[command(name = "trust-tunnel-agent", bin_name = "trust-tunnel-agent")]
#[command(about = "Gateway agent brokering remote command execution")]
#[command(version, arg_required_else_help = true)]
pub struct AgentCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway agent server.
    Server(ServerArgs),
    /// Display the current version of trust-tunnel-agent.
    Version,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Path to the config file.
    #[arg(long, short = 'c', default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent() -> Result<(), CliError> {
    let cli = AgentCli::parse();

    init_logging();
    run_command(&cli.command)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let config = config::load(&args.config)?;

    tracing::info!("trust-tunnel-agent start...");
    if let Ok(rendered) = serde_json::to_string(&config) {
        tracing::info!(config = %rendered, "config");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let broker = Broker::new(config)?;
        let router = build_router(broker);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "agent listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("got SIGINT, quit with grace"),
        _ = sigterm.recv() => tracing::info!("got SIGTERM, quit immediately"),
    }
}
