//! stompgate - STOMP protocol bridge
//!
//! Speaks STOMP 1.0/1.1/1.2 over TCP in front of the in-memory reference broker.

use stompgate_server::{Config, MemoryBroker, MemoryBrokerSettings, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if STOMPGATE_CONFIG is set, then env overrides)
    let config_path = std::env::var("STOMPGATE_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting stompgate");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Server name: {}", config.protocol.server_name);
    if config.auth.required {
        tracing::info!("  Authentication: enabled ({} user(s))", config.auth.users.len());
    } else {
        tracing::info!("  Authentication: disabled");
    }
    if config.protocol.close_on_parse_error {
        tracing::info!("  Malformed frames close the connection");
    }

    let broker = MemoryBroker::new(MemoryBrokerSettings::from_config(&config));
    let server = Arc::new(Server::new(ServerConfig::from_config(&config), broker));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
