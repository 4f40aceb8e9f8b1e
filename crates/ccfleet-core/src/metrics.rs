//! `OpenTelemetry` metrics and trace export.
//!
//! Only compiled with the `metrics` Cargo feature. Sets up the OTLP exporter
//! for traces and metrics and exposes the fleet instruments recorded by the
//! daemon (instance transitions, quota rejections, terminal sessions).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, UpDownCounter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the `OpenTelemetry` providers alive.
///
/// Dropping does not flush; call [`MetricsGuard::shutdown`] before exit.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Gracefully shut down both providers, flushing any buffered telemetry.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the OTLP pipeline for traces and metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

static INSTANCE_TRANSITIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    global::meter("ccfleet")
        .u64_counter("ccfleet.instance.transitions")
        .with_description("Instance status transitions by target status")
        .build()
});

static QUOTA_REJECTIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    global::meter("ccfleet")
        .u64_counter("ccfleet.instance.quota_rejections")
        .with_description("Instance creations refused by the parallelism quota")
        .build()
});

static TERMINAL_SESSIONS: LazyLock<UpDownCounter<i64>> = LazyLock::new(|| {
    global::meter("ccfleet")
        .i64_up_down_counter("ccfleet.terminal.sessions")
        .with_description("Live pseudo-terminal sessions")
        .build()
});

/// Record an instance entering `status`.
pub fn record_instance_transition(status: &str) {
    INSTANCE_TRANSITIONS.add(1, &[KeyValue::new("status", status.to_string())]);
}

/// Record a creation refused by the per-project quota.
pub fn record_quota_rejection(project_id: &str) {
    QUOTA_REJECTIONS.add(1, &[KeyValue::new("project_id", project_id.to_string())]);
}

/// Adjust the live terminal session gauge by `delta`.
pub fn record_terminal_sessions(delta: i64) {
    TERMINAL_SESSIONS.add(delta, &[]);
}
