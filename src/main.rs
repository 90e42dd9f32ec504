mod api;
mod config;
mod error;
mod heartbeat;
mod pool;
mod scraper;

use std::sync::Arc;

use axum::Router;
use dotenv::dotenv;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::Config;
use crate::pool::{BrowserPool, PoolConfig};
use crate::scraper::{ChromeSolver, ScrapeConfig};

#[derive(OpenApi)]
#[openapi(
    paths(api::solve, api::health),
    components(
        schemas(
            api::SolveRequest,
            api::SolveResponse,
            api::ErrorResponse,
            api::Solution,
            api::HealthResponse,
            api::MemoryInfo,
            api::StatsSnapshot,
            scraper::CookieData,
            pool::PoolStatus
        )
    ),
    tags(
        (name = "solver", description = "Challenge Solver API")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env();
    info!(
        "⚡ Silent Scraper v{} | Port: {} | Pool: {}",
        env!("CARGO_PKG_VERSION"),
        cfg.port,
        cfg.pool_size
    );

    // Chrome launches are blocking process spawns; keep them off the
    // async runtime.
    let pool = {
        let pool_cfg = PoolConfig {
            max_requests_per_browser: cfg.max_requests_per_browser,
            lease_retry_interval: cfg.lease_retry_interval,
            lease_max_retries: cfg.lease_max_retries,
        };
        let size = cfg.pool_size;
        let launch_cfg = cfg.clone();
        tokio::task::spawn_blocking(move || {
            BrowserPool::init(
                size,
                pool_cfg,
                Box::new(move || scraper::launch_browser(&launch_cfg)),
            )
        })
        .await??
    };

    let solver = Arc::new(ChromeSolver::new(pool.clone(), ScrapeConfig::from(&cfg)));
    let state = Arc::new(api::AppState::new(solver, cfg.default_max_timeout));

    let heartbeat_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = heartbeat::start_heartbeat(heartbeat_state).await {
            tracing::error!("🔥 Heartbeat error: {}", e);
        }
    });

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api::router(state));

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!("✅ Ready!");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.shutdown();
    info!("✅ Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("📛 Shutting down...");
}
