use clap::Parser;
use log::{error, info};
use netplay_server::config::ServerConfig;
use netplay_server::network::Server;
use std::path::PathBuf;

/// Loads the configuration, starts the relay and runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// TOML configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Address to bind the rendezvous port to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Rendezvous port
        #[clap(short, long)]
        port: Option<u16>,
        /// Maximum number of connected users
        #[clap(long)]
        max_users: Option<usize>,
        /// Maximum number of games, 0 for unlimited
        #[clap(long)]
        max_games: Option<usize>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max_users) = args.max_users {
        config.max_users = max_users;
    }
    if let Some(max_games) = args.max_games {
        config.max_games = max_games;
    }

    let server = Server::bind(config).await?;
    let handle = server.start()?;
    info!("Relay ready on {}", handle.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");
    handle.shutdown().await;
    Ok(())
}
