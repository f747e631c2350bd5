use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// Flushes buffered spans when the process winds down. Export is batched,
/// so letting the runtime exit without this drops the tail of a run —
/// usually the most interesting part of a failed one.
pub struct TelemetryGuard {
    _seal: (),
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Counts ERROR-level events into `tracing_error_events` so alerting can
/// key off error volume without parsing the log stream.
struct ErrorEventCounter;

impl<S: Subscriber> Layer<S> for ErrorEventCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().level() == &tracing::Level::ERROR {
            metrics::counter!("tracing_error_events").increment(1);
        }
    }
}

/// Assemble the process-wide tracing stack.
///
/// JSON lines on stdout are the contract with the log shipper; the filter
/// honors `RUST_LOG` first and falls back to the configured level. Span
/// export is strictly opt-in via `OTEL_EXPORTER_OTLP_ENDPOINT`: most
/// invocations are one-shot CLI commands fired from cron on hosts with no
/// collector, and a mandatory exporter would turn each of those runs into
/// connection-error noise.
pub fn build_dispatch(
    service_name: &str,
    default_level: &str,
) -> (tracing::Dispatch, Option<TelemetryGuard>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .json();
    let base = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorEventCounter);

    match otlp_tracer(service_name) {
        Some(tracer) => {
            let stack = base.with(tracing_opentelemetry::layer().with_tracer(tracer));
            (
                tracing::Dispatch::new(stack),
                Some(TelemetryGuard { _seal: () }),
            )
        }
        None => (tracing::Dispatch::new(base), None),
    }
}

/// Build the OTLP span pipeline when an endpoint is configured, installing
/// the provider globally. Returns None (logs-only operation) when the env
/// var is absent or the exporter cannot be constructed. Needs a running
/// Tokio runtime for the batch exporter.
fn otlp_tracer(service_name: &str) -> Option<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            // tracing is not installed yet; stderr is all we have.
            eprintln!("OTLP exporter setup failed, continuing with logs only: {err}");
            return None;
        }
    };

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("wallet_intel");
    let _ = opentelemetry::global::set_tracer_provider(provider);
    Some(tracer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_is_logs_only_without_endpoint() {
        // The test environment sets no OTLP endpoint, so no guard comes back
        // and the dispatcher is plain logs + metrics.
        let (dispatch, guard) = build_dispatch("wallet_intel_test", "info");
        assert!(guard.is_none());
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("observability smoke test");
        });
    }
}
