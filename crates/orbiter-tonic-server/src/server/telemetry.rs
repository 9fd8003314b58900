//! Logging, tracing and metrics setup.
//!
//! Console logging through `tracing_subscriber::fmt` is always installed and
//! filtered by `RUST_LOG` (default `info`). Everything else is opt-in:
//!
//! - `tracing`: export spans through OpenTelemetry.
//! - `metrics`: export the instruments listed below.
//! - `honeycomb`: OTLP/gRPC exporter configured from `HONEYCOMB_*` variables.
//! - `stdout`: OpenTelemetry stdout exporter.
//!
//! Exporters need at least one of `tracing` or `metrics`; `honeycomb` and
//! `stdout` may be enabled together.
//!
//! ```bash
//! cargo run --bin orbiter-server --features tracing,metrics,stdout
//! ```
//!
//! ## Metrics
//!
//! Call sites report a [`Metric`] through [`record`], which is a no-op
//! unless the `metrics` feature is on.
//!
//! | Instrument | Kind | Fed by |
//! |---|---|---|
//! | `requests` | counter, by `rpc.method` | [`Metric::Request`] |
//! | `streams_inflight` | up/down counter | [`Metric::StreamOpened`], [`Metric::StreamClosed`] |
//! | `stream_errors` | counter | [`Metric::StreamError`] |
//! | `stream_duration` | histogram (ms) | [`Metric::StreamFinished`] |
//! | `items_computed`, `item_failures` | counters | [`Metric::Items`] |
//! | `items_per_request` | histogram | [`Metric::RequestSize`] |
//! | `protocol_violations` | counter | [`Metric::ProtocolViolation`] |

#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use core::time::Duration;
use orbiter::BulkReport;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(any(feature = "metrics", feature = "tracing"))]
const SERVICE_NAME: &str = "orbiter";

#[cfg(any(
    all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")),
    all(feature = "metrics", feature = "stdout")
))]
const EXPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Something worth counting, reported from the request path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    /// A call passed admission.
    Request { method: &'static str },
    StreamOpened,
    StreamClosed,
    /// A call or stream ended with an error status.
    StreamError,
    /// A response stream delivered its last batch.
    StreamFinished { elapsed: Duration },
    /// `computed` outcomes went out in a batch or a bulk response, `failed`
    /// of them failures.
    Items { computed: u64, failed: u64 },
    /// Size of an accepted bulk request.
    RequestSize { items: usize },
    /// A stream was refused by the config-first handshake.
    ProtocolViolation,
}

impl Metric {
    /// Every outcome of a finished unary bulk call.
    pub fn bulk<O>(report: &BulkReport<O>) -> Self {
        Self::Items {
            computed: report.outcomes.len() as u64,
            failed: report.failed as u64,
        }
    }
}

/// Records `metric` on the global instruments, if any are installed.
pub fn record(metric: Metric) {
    #[cfg(feature = "metrics")]
    {
        if let Some(instruments) = INSTRUMENTS.get() {
            instruments.record(metric);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = metric;
}

/// Handles to the installed providers, kept alive until shutdown.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    tracer: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    meter: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. Failures go to stderr because the
    /// subscriber may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            let flushed = self.tracer.force_flush();
            if let Err(err) = flushed.and_then(|()| self.tracer.shutdown()) {
                eprintln!("orbiter: span exporter did not shut down cleanly: {err}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            let flushed = self.meter.force_flush();
            if let Err(err) = flushed.and_then(|()| self.meter.shutdown()) {
                eprintln!("orbiter: metric exporter did not shut down cleanly: {err}");
            }
        }
    }
}

/// Installs the global subscriber and whichever exporters are compiled in.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    let console = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_thread_names(true)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(console);

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    #[cfg(feature = "tracing")]
    let (registry, tracer) = {
        use opentelemetry::trace::TracerProvider;

        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let tracer = tracer_provider()?;
        opentelemetry::global::set_tracer_provider(tracer.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(tracer.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true);
        (registry.with(layer), tracer)
    };

    #[cfg(feature = "metrics")]
    let (registry, meter) = {
        let meter = meter_provider()?;
        opentelemetry::global::set_meter_provider(meter.clone());
        let instruments = Instruments::new(&opentelemetry::global::meter_with_scope(scope));
        let _ = INSTRUMENTS.set(instruments);
        let layer = tracing_opentelemetry::MetricsLayer::new(meter.clone());
        (registry.with(layer), meter)
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer,
        #[cfg(feature = "metrics")]
        meter,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Honeycomb OTLP settings, read from `HONEYCOMB_API_KEY`,
/// `HONEYCOMB_DATASET`, `HONEYCOMB_ENDPOINT` and `HONEYCOMB_COMPRESSION`.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    metadata: tonic::metadata::MetadataMap,
    endpoint: String,
    compression: opentelemetry_otlp::Compression,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));

        let mut metadata = tonic::metadata::MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?
                .parse()
                .context("HONEYCOMB_API_KEY is not a valid header value")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?
                .parse()
                .context("HONEYCOMB_DATASET is not a valid header value")?,
        );

        Ok(Self {
            metadata,
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression: var("HONEYCOMB_COMPRESSION")?
                .to_ascii_lowercase()
                .parse()?,
        })
    }
}

/// Points an OTLP exporter builder at Honeycomb over TLS gRPC.
#[cfg(feature = "honeycomb")]
macro_rules! honeycomb_exporter {
    ($builder:expr) => {{
        use opentelemetry_otlp::{WithExportConfig, WithTonicConfig};

        let honeycomb = Honeycomb::from_env()?;
        $builder
            .with_tonic()
            .with_tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
            .with_metadata(honeycomb.metadata)
            .with_compression(honeycomb.compression)
            .with_endpoint(honeycomb.endpoint)
            .with_protocol(opentelemetry_otlp::Protocol::Grpc)
            .with_timeout(Duration::from_secs(10))
    }};
}

#[cfg(feature = "tracing")]
fn tracer_provider() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(span_batcher(
        opentelemetry_stdout::SpanExporter::default(),
    ));

    #[cfg(feature = "honeycomb")]
    let builder = {
        let exporter = honeycomb_exporter!(opentelemetry_otlp::SpanExporter::builder()).build()?;
        builder.with_span_processor(span_batcher(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")))]
fn span_batcher<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: sdktrace::SpanExporter + 'static,
{
    let config = sdktrace::BatchConfigBuilder::default()
        .with_scheduled_delay(EXPORT_INTERVAL)
        .with_max_queue_size(4096)
        .build();
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(config)
        .build()
}

#[cfg(feature = "metrics")]
fn meter_provider() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(EXPORT_INTERVAL)
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        let exporter = honeycomb_exporter!(opentelemetry_otlp::MetricExporter::builder())
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static INSTRUMENTS: std::sync::OnceLock<Instruments> = std::sync::OnceLock::new();

#[cfg(feature = "metrics")]
struct Instruments {
    requests: Counter<u64>,
    streams_inflight: UpDownCounter<i64>,
    stream_errors: Counter<u64>,
    stream_duration_ms: Histogram<f64>,
    items_computed: Counter<u64>,
    item_failures: Counter<u64>,
    items_per_request: Histogram<f64>,
    protocol_violations: Counter<u64>,
}

#[cfg(feature = "metrics")]
impl Instruments {
    fn new(meter: &Meter) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            meter.u64_counter(name).with_description(description).build()
        };

        Self {
            requests: counter("requests", "Accepted gRPC calls"),
            streams_inflight: meter
                .i64_up_down_counter("streams_inflight")
                .with_description("Open response streams")
                .build(),
            stream_errors: counter(
                "stream_errors",
                "Calls and streams that ended with an error status",
            ),
            stream_duration_ms: meter
                .f64_histogram("stream_duration")
                .with_unit("ms")
                .with_description("Admission to last batch")
                .build(),
            items_computed: counter("items_computed", "Outcomes delivered to clients"),
            item_failures: counter("item_failures", "Outcomes delivered as failure entries"),
            items_per_request: meter
                .f64_histogram("items_per_request")
                .with_description("Items in a bulk request")
                .build(),
            protocol_violations: counter(
                "protocol_violations",
                "Streams refused by the config-first handshake",
            ),
        }
    }

    fn record(&self, metric: Metric) {
        match metric {
            Metric::Request { method } => self
                .requests
                .add(1, &[KeyValue::new("rpc.method", method)]),
            Metric::StreamOpened => self.streams_inflight.add(1, &[]),
            Metric::StreamClosed => self.streams_inflight.add(-1, &[]),
            Metric::StreamError => self.stream_errors.add(1, &[]),
            Metric::StreamFinished { elapsed } => self
                .stream_duration_ms
                .record(elapsed.as_secs_f64() * 1_000.0, &[]),
            Metric::Items { computed, failed } => {
                self.items_computed.add(computed, &[]);
                if failed > 0 {
                    self.item_failures.add(failed, &[]);
                }
            }
            Metric::RequestSize { items } => self.items_per_request.record(items as f64, &[]),
            Metric::ProtocolViolation => self.protocol_violations.add(1, &[]),
        }
    }
}
