//! Tracing subscriber and OTLP export for genq processes.
//!
//! Without an endpoint only the fmt layer is installed. With one, spans and
//! logs go to the collector, and so do the queue metrics when this process
//! holds the store.

pub mod metrics;
pub mod task;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Mode};
use crate::error::{Error, Result};

/// Targets that are too chatty at the process log level.
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "h2=warn", "hyper_util=warn", "tower=warn"];

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Reported as the `genq.mode` resource attribute.
    pub mode: Mode,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.into(),
            log_level: config.log_level.clone(),
            mode: config.mode,
        }
    }

    /// Task metrics are recorded by the store, which worker mode lacks.
    fn exports_metrics(&self) -> bool {
        self.mode != Mode::Worker
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                    env!("CARGO_PKG_VERSION"),
                ),
                KeyValue::new("genq.mode", self.mode.as_str()),
            ])
            .build()
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(&self.log_level)))
    }
}

fn default_directive(log_level: &str) -> String {
    std::iter::once(log_level).chain(QUIET_TARGETS.iter().copied()).collect::<Vec<_>>().join(",")
}

/// Flushes and shuts down the OTLP pipelines on drop. Hold it for the
/// lifetime of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl TelemetryGuard {
    /// Push buffered signals out now. Tests call this before querying backends.
    pub fn force_flush(&self) {
        if let Some(provider) = &self.tracer_provider {
            let _ = provider.force_flush();
        }
        if let Some(provider) = &self.meter_provider {
            let _ = provider.force_flush();
        }
        if let Some(provider) = &self.logger_provider {
            let _ = provider.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.tracer_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn otlp_pipelines(config: &TelemetryConfig, endpoint: &str) -> Result<TelemetryGuard> {
    use opentelemetry_otlp::WithExportConfig as _;

    let resource = config.resource();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("span"))?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let meter_provider = if config.exports_metrics() {
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build();
        opentelemetry::global::set_meter_provider(provider.clone());
        Some(provider)
    } else {
        None
    };

    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("log"))?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
        meter_provider,
        logger_provider: Some(logger_provider),
    })
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let init_error = |e: tracing_subscriber::util::TryInitError| {
        Error::Other(format!("failed to init tracing subscriber: {e}"))
    };

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(config.filter())
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(init_error)?;
        return Ok(TelemetryGuard::default());
    };

    let guard = otlp_pipelines(&config, endpoint)?;
    let trace_layer = guard
        .tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("genq")));
    let log_layer = guard
        .logger_provider
        .as_ref()
        .map(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new);

    tracing_subscriber::registry()
        .with(config.filter())
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(init_error)?;

    tracing::info!(mode = config.mode.as_str(), endpoint, "exporting telemetry");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use opentelemetry::Key;

    use super::*;

    fn config(mode: Mode) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: None,
            service_name: "genq-worker".into(),
            log_level: "debug".into(),
            mode,
        }
    }

    #[test]
    fn resource_names_the_queue_mode() {
        let resource = config(Mode::Server).resource();
        assert_eq!(
            resource.get(&Key::from_static_str("genq.mode")).map(|v| v.to_string()),
            Some("server".to_string())
        );
        assert_eq!(
            resource.get(&Key::from_static_str("service.name")).map(|v| v.to_string()),
            Some("genq-worker".to_string())
        );
    }

    #[test]
    fn only_store_holders_export_metrics() {
        assert!(config(Mode::Local).exports_metrics());
        assert!(config(Mode::Server).exports_metrics());
        assert!(!config(Mode::Worker).exports_metrics());
    }

    #[test]
    fn default_filter_quiets_dependencies() {
        assert_eq!(
            default_directive("debug"),
            "debug,sqlx=warn,h2=warn,hyper_util=warn,tower=warn"
        );
    }
}
