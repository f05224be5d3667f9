//! `parley-exchange`: run a local HTTP message exchange.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use parley::exchange::http::{ExchangeServerConfig, spawn_exchange_server};
use parley::logging::init_logging;
use parley::socket::wait_connection;

#[derive(Debug, Parser)]
#[command(name = "parley-exchange", about = "Run a parley HTTP message exchange")]
struct Args {
    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind; 0 selects a free port.
    #[arg(long, default_value_t = 5346)]
    port: u16,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for the server to accept connections.
    #[arg(long, default_value_t = 5.0)]
    startup_timeout: f64,

    /// Require this bearer token on every request.
    #[arg(long)]
    auth_token: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "exchange server failed");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let config = ExchangeServerConfig {
        host: args.host,
        port: args.port,
        auth_token: args.auth_token,
        ..ExchangeServerConfig::default()
    };
    let server = spawn_exchange_server(config)
        .await
        .context("failed to bind exchange server")?;
    let addr = server.addr();

    wait_connection(
        &addr.to_string(),
        Duration::from_secs_f64(args.startup_timeout),
    )
    .await
    .context("exchange server did not come up in time")?;
    info!(%addr, "exchange ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    server.stop().await.context("server exited with error")?;
    Ok(())
}
