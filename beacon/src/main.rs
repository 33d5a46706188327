use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use beacon_core::{load_config, logging};
use beacon_registry::RegistryServer;

#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(about = "Service liveness registry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the registry HTTP API
    Serve {
        /// Config file (YAML or TOML)
        #[arg(long, env = "BEACON_CONFIG_PATH")]
        config: Option<String>,

        /// Override `server.http_port`
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, port } => serve(config.as_deref(), port).await,
    }
}

async fn serve(config_path: Option<&str>, port: Option<u16>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.server.http_port = port;
    }

    logging::init_logging(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.http_address(),
        stale_after_secs = config.registry.stale_after_secs,
        sweep_interval_secs = config.registry.sweep_interval_secs,
        "Beacon registry starting"
    );

    let server = RegistryServer::new(config.server.clone(), config.registry.clone());
    let cancel = server.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, starting graceful shutdown...");
        cancel.cancel();
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "Registry server failed");
        return Err(e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
