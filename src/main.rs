// src/main.rs

//! The main entry point for the Sentra cluster daemon.

use sentra::config::Config;
use sentra::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Sentra cluster daemon version {VERSION}");
        return;
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "cluster.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("cluster.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(server::exit_codes::BAD_CONFIG);
        }
    };

    // Override port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).and_then(|s| s.parse::<u16>().ok()) {
            Some(port) => config.port = port,
            None => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(server::exit_codes::BAD_CONFIG);
            }
        }
    }

    // Setup logging. RUST_LOG overrides the configured level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config, server::Extensions::default()).await {
        error!("Cluster runtime error: {}", e);
        std::process::exit(server::exit_code_for(&e));
    }
}
