use clap::Parser;
use std::time::Duration;
use tokio::net::TcpListener;

use bitmap_server::config::{generate_config_template, Cli, Config};
use bitmap_server::state::AppState;
use bitmap_server::ws::ConnectionRegistry;
use bitmap_server::routes;

const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    // Initialize tracing/logging
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bitmap_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter()).init();
    }

    tracing::info!("Bitmap server v{} starting", env!("CARGO_PKG_VERSION"));

    // One registry for the process, shared by the WebSocket endpoint and
    // every route that sends notifications.
    let registry = ConnectionRegistry::new();
    let app_state = AppState::new(registry, config.ws.clone());

    let app = routes::build_router(app_state.clone());

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        ws_path = %config.ws.path,
        "HTTP API and WebSocket server listening on {}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state.clone()))
        .await?;

    // Upgraded sockets outlive `serve`; give their close frames time to go out.
    if !app_state.drain_connections(CONNECTION_DRAIN_TIMEOUT).await {
        tracing::warn!(
            remaining = app_state.connections.len(),
            "WebSocket connections still open after drain timeout"
        );
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM, then tell every connection actor to close.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let closing = state.begin_shutdown();
    tracing::info!(
        connections = closing,
        "Shutdown signal received, closing WebSocket connections"
    );
}
