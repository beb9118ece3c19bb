//! PayQueue Server
//!
//! Runs the payment HTTP API and the three worker pools in one process:
//! - `payments_queue`: claims `pending` payments and calls a gateway
//! - `payments_failing_queue`: retries `failing` payments
//! - `processed_watcher`: republishes the rolling routing threshold
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PROCESSOR_DEFAULT_URL` | - | Default gateway base URL (required) |
//! | `PROCESSOR_FALLBACK_URL` | - | Fallback gateway base URL (required) |
//! | `DB_CONNECTION_STRING` | - | PostgreSQL URL (required for `postgres`) |
//! | `PQ_STORE` | `postgres` | `postgres` or `memory` |
//! | `PQ_CONFIG_FILE` | - | Optional TOML config file |
//! | `PORT` | `9999` | HTTP API port |
//! | `LOG_FORMAT` | `text` | `text` or `json` |
//! | `RUST_LOG` | `info` | Log level |
//!
//! See `pq-config` for the engine tuning variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pq_api::{create_router, AppState};
use pq_config::{AppConfig, StoreBackend};
use pq_engine::{HttpGateway, PaymentEngine};
use pq_store::{MemoryPaymentRepository, PaymentRepository, PostgresPaymentRepository};
use sqlx::postgres::PgPoolOptions;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting PayQueue server");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    let repository = create_repository(&config).await?;
    let gateway = Arc::new(HttpGateway::new(&config.gateways).context("building gateway client")?);

    let shutdown = CancellationToken::new();
    let engine = PaymentEngine::with_shutdown(
        &config.engine,
        repository.clone(),
        gateway,
        shutdown.child_token(),
    );
    engine.start();

    let app = create_router(AppState {
        repository,
        routing: engine.state().clone(),
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        port = config.http.port,
        default_gateway = %config.gateways.default_url,
        fallback_gateway = %config.gateways.fallback_url,
        payments_pool = config.engine.payments_pool_size,
        failing_pool = config.engine.failing_pool_size,
        routing_policy = ?config.engine.routing_policy,
        "PayQueue server started"
    );

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;
    info!("Shutdown signal received...");
    shutdown.cancel();
    engine.stop();

    match server.await {
        Ok(Ok(())) => info!("HTTP server stopped"),
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    if engine.join(SHUTDOWN_TIMEOUT).await {
        info!("Worker pools drained");
    } else {
        warn!("Worker pools did not drain before timeout");
    }

    info!("PayQueue server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn create_repository(config: &AppConfig) -> Result<Arc<dyn PaymentRepository>> {
    match config.database.backend {
        StoreBackend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .context("DB_CONNECTION_STRING is required for the postgres store")?;
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            let repo = PostgresPaymentRepository::new(pool);
            repo.init_schema().await?;
            info!(
                max_connections = config.database.max_connections,
                required_connections = config.required_connections(),
                "Using PostgreSQL payment store"
            );
            Ok(Arc::new(repo))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory payment store, data is lost on restart");
            Ok(Arc::new(MemoryPaymentRepository::new()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
