//! teltrack-server: TCP endpoint for GPS/GSM tracking terminals.
//!
//! Terminals connect over TCP, authenticate with their hardware
//! identifier, and stream heartbeat and location reports which are
//! acknowledged per frame and persisted to SQLite. A separate HTTP
//! endpoint accepts JSON position reports and serves monitoring data.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

mod database;
mod logging;
mod registry;
mod server;
mod web;

use registry::DeviceRegistry;
use server::{Server, ServerConfig, SessionConfig};

/// teltrack-server - TCP endpoint for GPS/GSM tracking terminals
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on for terminal connections
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Address for the HTTP ingestion/monitoring endpoint
    #[arg(long, default_value = "0.0.0.0:8080")]
    web_listen: SocketAddr,

    /// Path to the database file
    #[arg(short, long, default_value = "teltrack.db")]
    database: PathBuf,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Close idle connections after this many seconds
    #[arg(long, default_value = "300")]
    idle_timeout: u64,

    /// Minimum seconds between accepted location reports per device
    #[arg(long, default_value = "10")]
    dedup_window: u64,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<String>,
    web_listen: Option<String>,
    idle_timeout_secs: Option<u64>,
    dedup_window_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct DatabaseSection {
    path: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("teltrack-server.toml");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::default()
    };

    // Merge logging configs (command line takes precedence)
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };

    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };

    let log_level = file_config.logging.level.as_deref();
    logging::init_logging(&log_dir, log_retention_days, args.verbose, log_level)
        .expect("Failed to initialize logging");

    // Merge listen address: PORT env > config file > command line
    let mut listen_addr = match &file_config.server.listen {
        Some(s) => s.parse::<SocketAddr>()?,
        None => args.listen,
    };
    if let Ok(port) = std::env::var("PORT") {
        match port.parse::<u16>() {
            Ok(port) => listen_addr.set_port(port),
            Err(_) => error!("Ignoring non-numeric PORT value: {}", port),
        }
    }

    let web_listen_addr = match &file_config.server.web_listen {
        Some(s) => s.parse::<SocketAddr>()?,
        None => args.web_listen,
    };
    let idle_timeout = file_config
        .server
        .idle_timeout_secs
        .unwrap_or(args.idle_timeout);
    let dedup_window = file_config
        .server
        .dedup_window_secs
        .unwrap_or(args.dedup_window);
    let db_path = file_config
        .database
        .path
        .map(PathBuf::from)
        .unwrap_or(args.database);

    // Initialize database
    info!("Opening database: {:?}", db_path);
    let db = match database::Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };
    let db = Arc::new(tokio::sync::Mutex::new(db));

    let registry = Arc::new(DeviceRegistry::new());

    let config = ServerConfig {
        listen_addr,
        session: SessionConfig {
            idle_timeout: Duration::from_secs(idle_timeout),
            dedup_window: Duration::from_secs(dedup_window),
            ..SessionConfig::default()
        },
        database: db.clone(),
    };

    info!("teltrack-server starting...");
    info!("  Terminal endpoint: {}", config.listen_addr);
    info!("  Idle timeout: {}s", idle_timeout);
    info!("  Dedup window: {}s", dedup_window);
    info!("  Database: {:?}", db_path);

    // Start the HTTP ingestion/monitoring server
    let web_db = db.clone();
    let web_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        match web::start_web_server(web_listen_addr, web_db, web_registry).await {
            Ok(_) => info!("Ingestion endpoint stopped"),
            Err(e) => error!("Ingestion endpoint error: {}", e),
        }
    });

    // Run the terminal server
    let server = Server::new(config, registry);
    server.run().await?;

    Ok(())
}
