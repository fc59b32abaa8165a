//! Logging and OTLP export for the operator binary
//!
//! Logs always go to stdout as JSON. Traces and metrics leave the process
//! only when an OTLP endpoint is configured, and are flushed through
//! [`Telemetry::shutdown`] once the controller stops.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Service name on every span and metric
pub const SERVICE: &str = "meridian-operator";

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,meridian=debug,kube=info,tower=warn,hyper=warn";

/// Telemetry could not be set up
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// "traces" or "metrics"
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// OTLP pipelines that must be flushed before exit
pub struct Telemetry {
    tracer: TracerProvider,
    meter: SdkMeterProvider,
}

impl Telemetry {
    /// Flush and stop both pipelines
    pub fn shutdown(self) {
        if let Err(e) = self.tracer.shutdown() {
            warn!(error = %e, "Trace pipeline did not shut down cleanly");
        }
        if let Err(e) = self.meter.shutdown() {
            warn!(error = %e, "Metrics pipeline did not shut down cleanly");
        }
    }
}

/// Install the global subscriber, exporting to `otlp_endpoint` when given
pub fn init_telemetry(otlp_endpoint: Option<&str>) -> Result<Option<Telemetry>, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let telemetry = otlp_endpoint
        .map(|endpoint| export_to(endpoint, resource()))
        .transpose()?;
    let otel_layer = telemetry
        .as_ref()
        .map(|t| tracing_opentelemetry::layer().with_tracer(t.tracer.tracer(SERVICE)));

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(telemetry)
}

/// Service identity, plus the namespace the operator runs in when the
/// downward API provides it
fn resource() -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, SERVICE),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    Resource::new(attributes)
}

fn export_to(endpoint: &str, resource: Resource) -> Result<Telemetry, TelemetryError> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;

    let tracer = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource.clone())
        .build();
    let meter = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(tracer.clone());
    global::set_meter_provider(meter.clone());
    Ok(Telemetry { tracer, meter })
}
