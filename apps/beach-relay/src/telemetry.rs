use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-relay";
pub const OTEL_STDOUT_ENV: &str = "BEACH_RELAY_OTEL_STDOUT";

/// Process-wide logging, tracing and metrics. Hold it for the lifetime of the
/// binary; dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: Option<PrometheusHandle>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Install the tracing subscriber and, when `with_metrics` is set, the
    /// Prometheus recorder served from `/metrics`.
    pub fn init(with_metrics: bool) -> Result<Self> {
        let metrics_handle = if with_metrics {
            Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("failed to install Prometheus metrics recorder")?,
            )
        } else {
            None
        };

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(|| {
            SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                        .build(),
                )
                .build()
        });

        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> Option<PrometheusHandle> {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| is_truthy(&val))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
