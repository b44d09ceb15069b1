//! wsgate - WebSocket gateway server
//!
//! A WebSocket server with a structured-message RPC layer.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wsgate_protocol::Envelope;
use wsgate_server::{tls, Config, ConfigError, Module, ServerConfig, System, WsServer};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Resolves the configuration. A broken explicit config file is fatal;
/// without one the defaults plus env overrides apply.
fn load_config() -> Result<Config, ConfigError> {
    match Config::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var("WSGATE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            Ok(config)
        }
        Err(e) if std::env::var("WSGATE_CONFIG").is_ok() => {
            tracing::error!("Failed to load config: {}", e);
            Err(e)
        }
        Err(_) => {
            tracing::info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = load_config()?;

    tracing::info!("Starting wsgate server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);

    config.tls.validate()?;
    let tls_acceptor = match config.tls.enabled {
        true => {
            tracing::info!("  TLS: enabled");
            Some(tls::create_tls_acceptor(&config.tls)?)
        }
        false => {
            tracing::info!("  TLS: disabled");
            None
        }
    };

    // Built-in system module: sys.echo returns the request content.
    let system = System::new().module(
        "sys",
        Module::new().method("echo", |request: &Envelope| {
            Ok(Envelope::new().with_content(request.content.clone()))
        }),
    );

    let mut server_config = ServerConfig::from_network(&config.network);
    if let Some(acceptor) = tls_acceptor {
        server_config = server_config.with_tls(acceptor);
    }
    let server = Arc::new(WsServer::new(server_config, system));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.stop().await;
    });

    // Blocks until shutdown completes.
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
