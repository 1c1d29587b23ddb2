//! Logging and telemetry initialization with conditional OpenTelemetry support.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::settings::LoggingConfig;

#[cfg(feature = "with-observability")]
use {
    opentelemetry::{global as otel_global, KeyValue},
    opentelemetry_otlp::{self as otlp, WithExportConfig},
    opentelemetry_sdk::Resource,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` wins over the configured level
fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?)
}

fn fmt_layer(config: &LoggingConfig) -> BoxedLayer {
    if config.format.eq_ignore_ascii_case("json") {
        fmt::layer()
            .json()
            .with_target(config.enable_target)
            .with_thread_ids(config.enable_thread_ids)
            .boxed()
    } else {
        fmt::layer()
            .with_target(config.enable_target)
            .with_thread_ids(config.enable_thread_ids)
            .boxed()
    }
}

/// Initialize logging and telemetry based on configuration
pub fn init(config: &LoggingConfig, otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = env_filter(config)?;

    #[cfg(feature = "with-observability")]
    if let Some(endpoint) = otlp_endpoint {
        return init_with_otlp(config, endpoint, filter);
    }

    #[cfg(not(feature = "with-observability"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!("OTLP endpoint {endpoint} ignored: built without `with-observability`");
    }

    init_console_only(config, filter)
}

#[cfg(feature = "with-observability")]
fn init_with_otlp(config: &LoggingConfig, endpoint: &str, filter: EnvFilter) -> Result<()> {
    let tracer = otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(Resource::new(
            vec![KeyValue::new("service.name", "assistant_core")],
        )))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let subscriber = Registry::default()
        .with(fmt_layer(config))
        .with(filter)
        .with(telemetry);

    tracing::subscriber::set_global_default(subscriber)?;

    otel_global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );

    tracing::info!("Telemetry initialized with OTLP endpoint: {}", endpoint);
    Ok(())
}

fn init_console_only(config: &LoggingConfig, filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default().with(fmt_layer(config)).with(filter);

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("Console logging initialized ({})", config.format);
    Ok(())
}
