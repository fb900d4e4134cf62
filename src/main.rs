use std::net::SocketAddr;

use anyhow::Context;
use capwire::api::create_router;
use capwire::config::{Config, DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE_PORT};
use capwire::state::AppState;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Live network packet capture streaming from untouchable containers.
#[derive(Parser, Debug)]
#[command(name = "capwire", version)]
struct Cli {
    /// Port to expose the capture service on
    #[arg(short = 'p', long, default_value_t = DEFAULT_SERVICE_PORT)]
    port: u16,

    /// Name or address of the discovery service
    #[arg(long, default_value = "127.0.0.1")]
    discovery_service: String,

    /// Port of the local discovery service
    #[arg(long = "gw-port", default_value_t = DEFAULT_DISCOVERY_PORT)]
    gw_port: u16,

    /// Reverse proxy the discovery service frontend and API
    #[arg(long)]
    proxy_discovery: bool,

    /// Log debugging messages
    #[arg(long)]
    debug: bool,

    /// Log frontend HTTP/WS requests
    #[arg(long)]
    log_requests: bool,

    /// Log frontend HTTP/WS request headers (includes request logging)
    #[arg(long)]
    log_headers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "capwire=debug,tower_http=debug"
    } else {
        "capwire=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting capwire capture-as-a-service"
    );

    let config = Config {
        port: cli.port,
        discovery_host: cli.discovery_service,
        discovery_port: cli.gw_port,
        proxy_discovery: cli.proxy_discovery,
        log_requests: cli.log_requests,
        log_headers: cli.log_headers,
        ..Config::default()
    };
    if config.proxy_discovery {
        tracing::debug!("forwarding to discovery service enabled");
    }

    let state = AppState::new(config.clone());
    let app = create_router(state);

    let addr = format!("[::]:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind capture service to {addr}"))?;
    tracing::info!(addr = %addr, "capture service websocket server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}
