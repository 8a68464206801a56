//! Realtime Link - command line client
//!
//! Connects to the configured realtime endpoint with a token taken from the
//! environment, joins rooms, and logs incoming events until interrupted.

use clap::{Parser, Subcommand};
use realtime_link::config::RealtimeConfig;
use realtime_link::connection::{
    handler, ConnectionManager, ConnectionSnapshot, Room, SOCKET_CONNECTED, SOCKET_DISCONNECTED,
    SOCKET_ERROR,
};
use realtime_link::observability::init_default_logging;
use realtime_link::token::{EnvTokenProvider, TokenGateway};
use realtime_link::transport::socketio::SocketIoFactory;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Authenticated realtime connection client
#[derive(Parser)]
#[command(name = "realtime-link")]
#[command(about = "Authenticated realtime connection client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, join rooms, and log events until interrupted
    Run {
        /// Room to join, written `type:id`; may be repeated
        #[arg(long = "room", value_name = "TYPE:ID", value_parser = parse_room)]
        rooms: Vec<Room>,
        /// Event name to log; may be repeated
        #[arg(long = "listen", value_name = "EVENT")]
        listen: Vec<String>,
    },
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

fn parse_room(value: &str) -> Result<Room, String> {
    match value.split_once(':') {
        Some((room_type, room_id)) if !room_type.is_empty() && !room_id.is_empty() => {
            Ok(Room::new(room_type, room_id))
        }
        _ => Err(format!("expected TYPE:ID, got '{value}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting realtime-link v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { rooms, listen } => run(config, rooms, listen).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<RealtimeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(RealtimeConfig::load_from_file(path)?);
    }

    for candidate in ["realtime.toml", "config/realtime.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(RealtimeConfig::load_from_file(path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create realtime.toml".into())
}

async fn run(
    config: RealtimeConfig,
    rooms: Vec<Room>,
    listen: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(EnvTokenProvider::new(config.auth.token_env.clone()));
    let manager =
        ConnectionManager::from_config(SocketIoFactory::new(), &config, TokenGateway::new(provider));

    let _state = manager.subscribe(Arc::new(|snapshot: &ConnectionSnapshot| {
        info!(
            status = %snapshot.status,
            error = snapshot.error.as_deref().unwrap_or(""),
            "Connection state changed"
        );
    }));

    let mut subscriptions = Vec::new();
    for event in [SOCKET_CONNECTED, SOCKET_DISCONNECTED, SOCKET_ERROR] {
        subscriptions.push(manager.on(
            event,
            handler(move |payload| info!(event, payload = %payload, "Lifecycle event")),
        ));
    }
    for event in listen {
        let name = event.clone();
        subscriptions.push(manager.on(
            &event,
            handler(move |payload| info!(event = %name, payload = %payload, "Event received")),
        ));
    }

    for room in &rooms {
        manager.join_room(room.room_type(), room.room_id());
    }

    manager.connect(None).await?;
    info!(rooms = rooms.len(), "Connect issued, waiting for events");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    let final_state = manager.get_connection_state();
    if !final_state.is_connected {
        warn!(status = %final_state.status, "Shutting down while not connected");
    }
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    manager.cleanup();
    Ok(())
}

fn handle_config_command(
    config: &RealtimeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
