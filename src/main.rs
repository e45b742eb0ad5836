use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chainsite::storage::pool;
use chainsite::{AppResult, AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // Logging follows the config when it loaded; defaults otherwise so the
    // configuration error itself still gets logged.
    match &config {
        Ok(c) => init_tracing(&c.log_level, c.log_json),
        Err(_) => init_tracing("info", false),
    }

    info!("Starting chainsite v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        builder.json().with_current_span(true).init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: AppResult<Config>) -> Result<(), exitcode::ExitCode> {
    let config = config.map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        environment = %config.environment,
        host = %config.host,
        port = %config.port,
        cache_disabled = config.disable_cache,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    // Connect database and run migrations
    info!("Connecting to database...");
    let db = pool::connect(&config).await.map_err(|e| {
        error!("Failed to prepare database: {e}");
        exitcode::UNAVAILABLE
    })?;
    info!("Database ready");

    // Build application state and router
    let state = AppState::with_postgres(db, config.clone()).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health                 - Health check");
    info!("  GET  /ready                  - Readiness check");
    info!("  GET  /stats                  - Cache and limiter statistics");
    info!("  GET  /api/auth/csrf-token    - CSRF token for the session");
    info!("  POST /api/auth/register      - Create an account");
    info!("  POST /api/auth/login         - Log in");
    info!("  POST /api/auth/logout        - Log out");
    info!("  GET  /api/auth/me            - Current user");
    info!("  GET  /api/home, /api/whitepaper, /api/peopay, /api/technology, /api/validator-bonds");
    info!("  GET  /api/network-stats, /api/validator-stats");

    // Start server with graceful shutdown; ConnectInfo feeds client IP resolution
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shutdown background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
