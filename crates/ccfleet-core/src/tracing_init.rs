//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output,
//! and optionally wires the `OpenTelemetry` pipeline when the `metrics`
//! feature is enabled.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Guard returned by [`init_tracing_with_metrics`].
///
/// Without the `metrics` feature this is a unit placeholder so callers can
/// hold it unconditionally.
#[cfg(feature = "metrics")]
pub type TelemetryGuard = Option<crate::metrics::MetricsGuard>;
#[cfg(not(feature = "metrics"))]
pub type TelemetryGuard = ();

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"ccfleet_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing and, when an endpoint is given and the `metrics`
/// feature is compiled in, the OTLP exporter.
///
/// Exporter failures are logged and tracing falls back to plain output.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    let Some(endpoint) = metrics_endpoint else {
        init_tracing(default_filter, log_json);
        return None;
    };

    match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => {
            use opentelemetry::trace::TracerProvider as _;
            let tracer = opentelemetry::global::tracer_provider().tracer("ccfleet");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            if log_json {
                tracing_subscriber::registry()
                    .with(env_filter(default_filter))
                    .with(tracing_subscriber::fmt::layer().json())
                    .with(otel_layer)
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter(default_filter))
                    .with(tracing_subscriber::fmt::layer())
                    .with(otel_layer)
                    .init();
            }
            tracing::info!(endpoint, "OpenTelemetry export enabled");
            Some(guard)
        }
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(endpoint, error = %e, "OpenTelemetry init failed, continuing without export");
            None
        }
    }
}

/// Initialise tracing; the endpoint is ignored without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    init_tracing(default_filter, log_json);
    if let Some(endpoint) = metrics_endpoint {
        tracing::warn!(endpoint, "Metrics endpoint ignored: built without `metrics` feature");
    }
}
