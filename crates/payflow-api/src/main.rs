//! Payflow API server entry point.

use std::net::SocketAddr;

use payflow_api::app;
use payflow_api::config::AppConfig;
use payflow_api::error::AppError;
use payflow_api::jobs::{self, Shutdown};
use payflow_api::telemetry;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let tracer_provider = telemetry::init_tracing(&config.telemetry)?;
    telemetry::install_metrics(&config.telemetry.metrics_bind_address)?;

    tracing::info!("Starting Payflow API server");

    let services = app::build(&config).await?;
    let shutdown = Shutdown::new();
    let handles = jobs::spawn_all(&services.workers, app::schedule(&config), &shutdown);

    let router = app::router(services.state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("HTTP server stopped, stopping background jobs");
    shutdown.trigger();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "background job panicked");
        }
    }
    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "failed to flush traces");
        }
    }

    Ok(())
}
