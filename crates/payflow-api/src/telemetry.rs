//! Tracing subscriber, OTLP export and the Prometheus exporter.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, TelemetryConfig};
use crate::error::AppError;

/// Installs the global tracing subscriber.
///
/// Returns the tracer provider when OTLP export is enabled; the caller must
/// keep it and shut it down on exit so buffered spans are flushed.
///
/// # Errors
///
/// Returns `AppError::Telemetry` if the exporter cannot be built or a global
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<Option<SdkTracerProvider>, AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
    };

    let provider = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
                .map_err(|e| AppError::Telemetry(format!("OTLP exporter: {e}")))?;
            Some(
                SdkTracerProvider::builder()
                    .with_batch_exporter(exporter)
                    .build(),
            )
        }
        None => None,
    };
    let otel_layer = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("payflow")));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(filter)
        .try_init()
        .map_err(|e| AppError::Telemetry(e.to_string()))?;

    Ok(provider)
}

/// Starts the Prometheus scrape listener and installs it as the global
/// metrics recorder.
///
/// # Errors
///
/// Returns `AppError::Telemetry` if the address is invalid or the exporter
/// cannot be installed.
pub fn install_metrics(bind_address: &str) -> Result<(), AppError> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| AppError::Telemetry(format!("invalid metrics bind address: {e}")))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AppError::Telemetry(format!("prometheus exporter: {e}")))
}
