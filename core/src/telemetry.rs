//! Telemetry: tracing/log init and W3C trace-context propagation over envelope metadata.
//!
//! `init_telemetry` wires `tracing-subscriber` with an `EnvFilter`, optionally
//! layering an OpenTelemetry OTLP exporter on top when `OTEL_EXPORTER_OTLP_ENDPOINT`
//! is set. Context extraction/injection lets a span opened on one agent continue
//! as a child span on the agent (or bridge) that receives the envelope next.

use std::collections::HashMap;

use opentelemetry::global;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::envelope::keys;

/// Reads an env var as a boolean flag; unset or empty means `default`.
fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"),
        Err(_) => default,
    }
}

/// Initializes global tracing. Idempotent in practice: called once per process,
/// typically from `Agent::new` unless `LOOM_TELEMETRY_AUTO=false`.
pub fn init_telemetry(service_name: &str) {
    if !env_flag("LOOM_TELEMETRY_AUTO", true) {
        return;
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| service_name.to_string());
        match build_tracer_provider(&endpoint, &service_name) {
            Ok(provider) => {
                let tracer = provider.tracer(service_name);
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let _ = global::set_tracer_provider(provider);
                let _ = subscriber.with(otel_layer).try_init();
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to initialize OTLP exporter, falling back to local logging");
            }
        }
    }

    let _ = subscriber.try_init();
}

fn build_tracer_provider(
    endpoint: &str,
    service_name: &str,
) -> Result<TracerProvider, opentelemetry::trace::TraceError> {
    use opentelemetry_otlp::WithExportConfig;

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.to_string()),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
}

/// Flushes and shuts down the global tracer provider. Call on graceful agent stop.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// Adapts an envelope's metadata map for `opentelemetry`'s W3C propagator to read from.
struct MetadataExtractor<'a>(&'a HashMap<String, String>);

impl<'a> Extractor for MetadataExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Adapts an envelope's metadata map for the W3C propagator to write into.
struct MetadataInjector<'a>(&'a mut HashMap<String, String>);

impl<'a> Injector for MetadataInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Extracts a W3C trace context (`traceparent`/`tracestate`) from envelope
/// metadata and returns it as a parent `opentelemetry::Context`. Envelopes
/// carrying no trace headers yield the current (root) context.
pub fn extract_trace_context(metadata: &HashMap<String, String>) -> opentelemetry::Context {
    let propagator = TraceContextPropagator::new();
    propagator.extract(&MetadataExtractor(metadata))
}

/// Injects the current span's trace context into envelope metadata under the
/// standard `traceparent`/`tracestate` keys, so the next hop can continue the trace.
pub fn inject_trace_context(span: &Span, metadata: &mut HashMap<String, String>) {
    let propagator = TraceContextPropagator::new();
    let context = span.context();
    propagator.inject_context(&context, &mut MetadataInjector(metadata));
}

/// Opens a span as a child of the trace context carried in `metadata`, under
/// the given span name. Used for `agent.on_event` at delivery time.
pub fn span_from_metadata(name: &'static str, metadata: &HashMap<String, String>) -> Span {
    let parent_context = extract_trace_context(metadata);
    let span = tracing::info_span!("loom.event", otel.name = name);
    span.set_parent(parent_context);
    span
}

/// Reserved trace metadata keys, re-exported here for call sites that only
/// touch telemetry and shouldn't need to import `envelope::keys` directly.
pub const TRACEPARENT_KEY: &str = keys::TRACEPARENT;
pub const TRACESTATE_KEY: &str = keys::TRACESTATE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_on_empty_metadata_yields_current_context() {
        let metadata = HashMap::new();
        let _ctx = extract_trace_context(&metadata);
    }

    #[test]
    fn inject_then_extract_round_trips_traceparent() {
        let span = tracing::info_span!("test");
        let mut metadata = HashMap::new();
        inject_trace_context(&span, &mut metadata);
        // No active global tracer in test context guarantees no traceparent is
        // emitted for a noop span, but the call must not panic either way.
        let _ctx = extract_trace_context(&metadata);
    }
}
