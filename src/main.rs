// src/main.rs

//! The main entry point for the Timbre server binary.

use anyhow::Result;
use timbre::config::Config;
use timbre::core::persistence::{Freezer, FreezerOp};
use timbre::core::users;
use timbre::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Timbre version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise it defaults to "timbre.toml". A missing default
    // file falls back to built-in defaults.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let mut config = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration from {path:?}: {e}");
                std::process::exit(1);
            }
        },
        None => match Config::from_file("timbre.toml") {
            Ok(config) => config,
            Err(_) => Config::default(),
        },
    };

    // Override port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).and_then(|p| p.parse::<u16>().ok()) {
            Some(port) => config.port = port,
            None => {
                eprintln!("--port requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    // Setup logging. RUST_LOG wins over the configured level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    // --supw sets the super-user secret through the freezer and exits
    // without starting the server.
    if let Some(supw_index) = args.iter().position(|arg| arg == "--supw") {
        let Some(password) = args.get(supw_index + 1) else {
            eprintln!("--supw requires a password argument");
            std::process::exit(1);
        };
        return set_super_user_password(&config, password).await;
    }

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}

async fn set_super_user_password(config: &Config, password: &str) -> Result<()> {
    let record = users::hash_super_user_password(password)?;
    let (mut freezer, mut image) = Freezer::open(
        config.snapshot_path(),
        config.log_path(),
        config.persistence.snapshot_ops,
    )
    .await?;
    let op = FreezerOp::ConfigSet {
        key: "SuperUserPassword".to_string(),
        value: record,
    };
    freezer.append(&op).await?;
    op.apply(&mut image);
    freezer.snapshot(&image).await?;
    println!("SuperUser password updated.");
    Ok(())
}
