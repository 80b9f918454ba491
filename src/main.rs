use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bugtrack::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "bugtrack")]
#[command(version, about = "Bug tracking API with live resolution analytics")]
struct Cli {
    /// Port to listen on. Overrides the PORT environment variable.
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path. Overrides BUGTRACK_DB.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Bind on all interfaces and allow permissive CORS.
    #[arg(long)]
    dev: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Environment fallbacks with warnings, so local development works without
/// any configuration.
fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();

    match std::env::var("PORT") {
        Ok(raw) => match raw.parse() {
            Ok(port) => config.port = port,
            Err(_) => warn!("PORT '{}' is not a valid port, using default {}", raw, config.port),
        },
        Err(_) => info!("PORT not set, using default {}", config.port),
    }

    match std::env::var("JWT_SECRET") {
        Ok(secret) => config.jwt_secret = secret,
        Err(_) => warn!("JWT_SECRET not set — using insecure default for development"),
    }

    if let Ok(path) = std::env::var("BUGTRACK_DB") {
        config.db_path = PathBuf::from(path);
    }

    config
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = config_from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.dev_mode = cli.dev;

    start_server(config).await
}
