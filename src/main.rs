//! ngsock loopback engine - main entry point.
//!
//! Serves the loopback reference engine on filesystem sockets so that
//! dispatchers in other processes can run against it.

use clap::Parser;
use ngsock::Config;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "ngsock-loopback", about = "Loopback engine for ngsock dispatchers")]
struct Args {
    /// Engine control socket path.
    #[arg(long, env = "NGSOCK_ENGINE_CONTROL")]
    control: Option<PathBuf>,

    /// Engine data socket path.
    #[arg(long, env = "NGSOCK_ENGINE_DATA")]
    data: Option<PathBuf>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_env();
    if let Some(control) = args.control {
        config.channel.engine_control = control;
    }
    if let Some(data) = args.data {
        config.channel.engine_data = data;
    }
    config.observability.json_logs |= args.json_logs;

    // Initialize observability
    ngsock::observability::init_tracing_with(&config.observability);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for ctrl-c: {}", e);
            return;
        }
        on_signal.cancel();
    });

    ngsock::loopback::serve(&config.channel, cancel).await?;
    Ok(())
}
