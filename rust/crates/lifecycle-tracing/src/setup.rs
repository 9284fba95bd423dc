//! Sets up tracing globally.

use std::error::Error;

use opentelemetry::propagation::composite::TextMapCompositePropagator;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_semantic_conventions as semcov;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::trace::Instrumentation;

const DEFAULT_LEVEL: tracing::level_filters::LevelFilter =
    tracing::level_filters::LevelFilter::INFO;

/// What to report traces as, and where to send them.
///
/// Anything not set here is taken from the standard environment variables:
///
///   * https://opentelemetry.io/docs/specs/otel/configuration/sdk-environment-variables/
///   * https://opentelemetry.io/docs/languages/sdk-configuration/otlp-exporter/
///
/// Log filtering follows `RUST_LOG`, defaulting to `default_level`.
#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: &'static str,
    pub service_version: &'static str,
    /// The OTLP collector endpoint.
    pub endpoint: Option<String>,
    pub default_level: tracing::level_filters::LevelFilter,
}

impl Config {
    pub fn new(service_name: &'static str, service_version: &'static str) -> Self {
        Self {
            service_name,
            service_version,
            endpoint: None,
            default_level: DEFAULT_LEVEL,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// The installed global tracing provider, along with the request
/// instrumentation bound to its tracer.
pub struct GlobalTracing {
    instrumentation: Instrumentation,
}

impl GlobalTracing {
    /// The instrumentation to wrap the HTTP server with.
    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }
}

/// Initialize a generic tracing setup that exports traces, and install it as
/// the global tracing provider.
///
/// The tracing provider will be unregistered on drop.
///
/// If another subscriber is already installed, spans are still exported but
/// log output stays with the existing subscriber.
pub fn init_tracing(config: &Config) -> Result<GlobalTracing, Box<dyn Error + Send + Sync>> {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(opentelemetry_zipkin::Propagator::new()),
    ]));

    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    exporter = if let Some(endpoint) = &config.endpoint {
        exporter.with_endpoint(endpoint.clone())
    } else {
        exporter
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new(semcov::resource::SERVICE_NAME, config.service_name),
                KeyValue::new(semcov::resource::SERVICE_VERSION, config.service_version),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let installed = tracing_subscriber::registry()
        .with(
            tracing_opentelemetry::layer()
                .with_error_records_to_exceptions(true)
                .with_tracer(tracer.clone()),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(config.default_level.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_timer(tracing_subscriber::fmt::time::time()),
        )
        .try_init();
    if let Err(error) = installed {
        tracing::debug!(%error, "a tracing subscriber is already installed");
    }

    Ok(GlobalTracing {
        instrumentation: Instrumentation::with_tracer(tracer),
    })
}

impl Drop for GlobalTracing {
    fn drop(&mut self) {
        global::shutdown_tracer_provider();
    }
}
