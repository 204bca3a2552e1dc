//! Tracing subscriber setup.
//!
//! Local logging always runs: a `fmt` layer writing to stdout, or to the
//! configured log file in append mode. When `OTEL_*` environment variables
//! are present an OpenTelemetry OTLP span exporter is layered on top.
//! The level filter comes from `RUST_LOG` when set, else the configured
//! log level.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use opentelemetry_semantic_conventions::attribute::{
    DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION,
};
use std::env;
use std::fs::{File, OpenOptions};
use std::sync::Arc;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Telemetry protocol to use for OTLP export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelemetryProtocol {
    Http,
    Grpc,
}

impl TelemetryProtocol {
    /// Determines the telemetry protocol from environment variables, if
    /// OTLP export is configured at all.
    fn from_env() -> Option<Self> {
        let is_enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        if !is_enabled {
            return None;
        }
        match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => Some(TelemetryProtocol::Grpc),
            _ => Some(TelemetryProtocol::Http),
        }
    }
}

/// Semantic OpenTelemetry resource describing this service.
fn resource() -> Resource {
    let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
    Resource::builder()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_schema_url(
            [
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env),
            ],
            SCHEMA_URL,
        )
        .build()
}

fn init_tracer_provider(protocol: TelemetryProtocol) -> SdkTracerProvider {
    let exporter = opentelemetry_otlp::SpanExporter::builder();
    let exporter = match protocol {
        TelemetryProtocol::Http => exporter.with_http().build(),
        TelemetryProtocol::Grpc => exporter.with_tonic().build(),
    };
    let exporter = exporter.expect("Failed to build OTLP span exporter");
    SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            1.0,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build()
}

/// Holder for the installed telemetry pipeline; shuts exporters down on
/// drop.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Install the global subscriber.
    ///
    /// Fails only when the configured log file cannot be opened.
    pub fn init(log_level: &str, log_file: Option<&str>) -> Result<Self, std::io::Error> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
        let file: Option<Arc<File>> = match log_file {
            Some(path) => Some(Arc::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };
        let registry = tracing_subscriber::registry().with(filter);

        let tracer_provider = match TelemetryProtocol::from_env() {
            Some(protocol) => {
                let tracer_provider = init_tracer_provider(protocol);
                let tracer = tracer_provider.tracer("deployscan");
                match file {
                    Some(file) => registry
                        .with(fmt::layer().with_ansi(false).with_writer(file))
                        .with(OpenTelemetryLayer::new(tracer))
                        .init(),
                    None => registry
                        .with(fmt::layer())
                        .with(OpenTelemetryLayer::new(tracer))
                        .init(),
                }
                tracing::info!("OpenTelemetry span export enabled via {protocol:?}");
                Some(tracer_provider)
            }
            None => {
                match file {
                    Some(file) => registry
                        .with(fmt::layer().with_ansi(false).with_writer(file))
                        .init(),
                    None => registry.with(fmt::layer()).init(),
                }
                None
            }
        };
        Ok(Self { tracer_provider })
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}
