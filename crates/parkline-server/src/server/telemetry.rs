//! # Telemetry Features
//!
//! Human-readable status lines are always logged through `tracing` and
//! printed by a `tracing_subscriber::fmt` layer filtered by `RUST_LOG`
//! (default `info`). On top of that, OpenTelemetry export is opt-in.
//!
//! ## Feature matrix
//!
//! - `otel`: Exports spans via `tracing-opentelemetry`.
//! - `metrics`: Exports pool and dispatch metrics (counters, histograms).
//! - `stdout`: Enables the stdout exporter for whichever of the above is on.
//!
//! ## Metrics behavior
//!
//! - `dispatches`, `workers_created`, `pool_growth`, `degraded_probes`,
//!   `items_processed` and `processing_errors` are monotonic counters.
//! - `pool_size` is an up/down counter of live workers.
//! - `dispatch_latency` records time from mailbox arrival to worker
//!   assignment, in milliseconds.
//! - The recording helpers below compile to no-ops when `metrics` is off.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features metrics,stdout
//! ```

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down any exporters. Failures are printed to stderr
    /// since the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder("parkline")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("parkline")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let reader = sdkmetrics::PeriodicReader::builder(
            opentelemetry_stdout::MetricExporter::default(),
        )
        .with_interval(std::time::Duration::from_secs(5))
        .build();
        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "otel")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let batch = sdktrace::BatchSpanProcessor::builder(
            opentelemetry_stdout::SpanExporter::default(),
        )
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
struct PoolMetrics {
    dispatches: Counter<u64>,
    workers_created: Counter<u64>,
    pool_growth: Counter<u64>,
    degraded_probes: Counter<u64>,
    items_processed: Counter<u64>,
    processing_errors: Counter<u64>,
    pool_size: UpDownCounter<i64>,
    dispatch_latency_ms: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<PoolMetrics> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = METRICS.set(PoolMetrics {
        dispatches: meter
            .u64_counter("dispatches")
            .with_description("Packages assigned to a worker")
            .build(),
        workers_created: meter
            .u64_counter("workers_created")
            .with_description("Workers spawned, initial and on demand")
            .build(),
        pool_growth: meter
            .u64_counter("pool_growth")
            .with_description("Workers spawned because every worker was saturated")
            .build(),
        degraded_probes: meter
            .u64_counter("degraded_probes")
            .with_description("Timed capacity probes against saturated workers")
            .build(),
        items_processed: meter
            .u64_counter("items_processed")
            .with_description("Packages completed by workers")
            .build(),
        processing_errors: meter
            .u64_counter("processing_errors")
            .with_description("Packages whose processing failed")
            .build(),
        pool_size: meter
            .i64_up_down_counter("pool_size")
            .with_description("Live workers in the pool")
            .build(),
        dispatch_latency_ms: meter
            .f64_histogram("dispatch_latency")
            .with_unit("ms")
            .with_description("Mailbox arrival to worker assignment")
            .build(),
    });
}

#[cfg(feature = "metrics")]
fn with_metrics(record: impl FnOnce(&PoolMetrics)) {
    if let Some(metrics) = METRICS.get() {
        record(metrics);
    }
}

#[cfg(feature = "metrics")]
pub fn increment_dispatches() {
    with_metrics(|m| m.dispatches.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_dispatches() {}

#[cfg(feature = "metrics")]
pub fn increment_workers_created() {
    with_metrics(|m| m.workers_created.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_workers_created() {}

#[cfg(feature = "metrics")]
pub fn increment_pool_growth() {
    with_metrics(|m| m.pool_growth.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_pool_growth() {}

#[cfg(feature = "metrics")]
pub fn increment_degraded_probes() {
    with_metrics(|m| m.degraded_probes.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_degraded_probes() {}

#[cfg(feature = "metrics")]
pub fn increment_items_processed() {
    with_metrics(|m| m.items_processed.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_items_processed() {}

#[cfg(feature = "metrics")]
pub fn increment_processing_errors() {
    with_metrics(|m| m.processing_errors.add(1, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_processing_errors() {}

#[cfg(feature = "metrics")]
pub fn adjust_pool_size(delta: i64) {
    with_metrics(|m| m.pool_size.add(delta, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn adjust_pool_size(_delta: i64) {}

#[cfg(feature = "metrics")]
pub fn record_dispatch_latency(latency_ms: f64) {
    with_metrics(|m| m.dispatch_latency_ms.record(latency_ms, &[]));
}

#[cfg(not(feature = "metrics"))]
pub fn record_dispatch_latency(_latency_ms: f64) {}
