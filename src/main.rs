use clap::Parser;
use spi_oauth_broker::app::{self, AppState};
use spi_oauth_broker::config;
use std::path::PathBuf;

/// SPI OAuth broker: obtains service provider tokens for SPIAccessToken
/// objects through the OAuth authorization-code flow.
#[derive(Parser, Debug)]
#[command(name = "spi-oauth-broker", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // CLI --port overrides config
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }

    tracing::info!(
        providers = cfg.providers.len(),
        api_server = %cfg.kubernetes.api_server,
        "Configuration loaded successfully"
    );
    for provider in &cfg.providers {
        tracing::info!(
            provider = %provider.provider_type,
            client_id = %provider.client_id,
            "  Service provider configured"
        );
    }

    let state = match AppState::from_config(&cfg) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Initialization error: {e}");
            std::process::exit(1);
        }
    };
    let router = app::router(state, &cfg.server.allowed_origins);

    let bind_addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    tracing::info!("Listening on {bind_addr}");
    tracing::info!("Base URL: {}", cfg.server.base_url);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {bind_addr}: {e}");
            std::process::exit(1);
        });

    axum::serve(listener, router).await.unwrap_or_else(|e| {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    });
}
