//! tetherd - per-session terminal daemon
//!
//! Started by a supervisor as `tetherd '<json-config>'`. Prints one
//! `{"pid","startTime"}` line on stdout once the socket is listening, then
//! serves the session until the process exits or SIGTERM/SIGINT arrives.
//! Logs go to stderr (filter with `RUST_LOG`).

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tetherd::bootstrap::{self, BootstrapConfig};

#[derive(Parser, Debug)]
#[command(name = "tetherd", version, about = "Persistent pseudo-terminal session daemon")]
struct Args {
    /// Session configuration as a JSON object:
    /// {command, args, cwd, env, cols, rows, socketPath, keepAlive?, replayLines?}
    config: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = BootstrapConfig::from_json(&args.config).context("Invalid tetherd configuration")?;
    run_daemon(config)
}

#[tokio::main]
async fn run_daemon(config: BootstrapConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tetherd=info".parse()?)
                .add_directive("tether_core=info".parse()?)
                .add_directive("tether_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        socket = %config.socket_path.display(),
        "tetherd starting"
    );

    if let Err(e) = bootstrap::run(config).await {
        error!(error = %e, "tetherd failed");
        return Err(e).context("tetherd terminated with an error");
    }

    info!("tetherd stopped");
    Ok(())
}
