use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use veiltun::{client::Client, config::Config, device, logging, server::Server};

/// TLS packet tunnel with HTTP camouflage
#[derive(Parser)]
#[command(name = "veiltun")]
#[command(about = "Relay a TUN interface over TLS, disguised as an idle web server")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config/veiltun.yml")]
    config: PathBuf,

    /// Report transient relay errors (overrides the config file)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept tunnel connections on the configured local address
    Server,
    /// Connect to the configured server address
    Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).await?;
    if cli.verbose {
        config.verbose = true;
    }

    logging::init_logging(&config.log, config.verbose).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Signal handler error: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    match cli.command {
        Commands::Server => {
            let server = Server::new(config.clone())?;
            let tun = device::open_tun(&config.tun)?;
            server.run(tun, shutdown).await?;
        }
        Commands::Client => {
            let client = Client::new(config.clone())?;
            let tun = device::open_tun(&config.tun)?;
            client.run(tun, shutdown).await?;
        }
    }

    tracing::info!("All tasks completed");
    Ok(())
}
