use clap::Parser;
use log::{info, warn};
use overworld_server::{BroadcastPolicy, Server, ServerConfig};
use overworld_shared::{TileMap, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address for the admin channel (disabled if omitted)
    #[arg(long)]
    admin_addr: Option<String>,

    /// Maximum number of concurrent players
    #[arg(short = 'm', long, default_value = "128")]
    max_players: usize,

    /// Disconnect clients that stay silent this long
    #[arg(long, default_value = "60")]
    idle_timeout_secs: u64,

    /// Whether a client receives the snapshot caused by its own update
    #[arg(long, value_enum, default_value_t = BroadcastPolicy::IncludeOriginator)]
    broadcast_policy: BroadcastPolicy,

    /// JSON file holding the initial tile map (array of rows)
    #[arg(long)]
    map: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let world = match &args.map {
        Some(path) => {
            let map: TileMap = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            info!(
                "Loaded {}x{} map from {}",
                map.width(),
                map.height(),
                path.display()
            );
            map
        }
        None => TileMap::default(),
    };

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        admin_addr: args.admin_addr,
        max_sessions: args.max_players,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        broadcast_policy: args.broadcast_policy,
        world,
        ..ServerConfig::default()
    };

    let server = Server::bind(config).await?;
    let control = server.control();

    // Handle shutdown gracefully
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                control.shutdown();
            }
            Err(e) => warn!("Could not listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;

    Ok(())
}
