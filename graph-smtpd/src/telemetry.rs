//! OTLP export of the relay counters.

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use serde::Deserialize;

/// Where, and whether, the relay counters are pushed
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Off by default, so a relay without a collector does not log an export
    /// failure every interval.
    pub enabled: bool,

    /// OTLP over HTTP endpoint, usually an OpenTelemetry Collector
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:4318/v1/metrics".to_string(),
        }
    }
}

/// Build the OTLP exporter for `config` and install it as the global meter
/// provider. Returns `None` when export is disabled.
///
/// The provider must be installed before the relay's
/// [`Metrics`](graph_smtpd_core::Metrics) are created, or their
/// instruments stay no-ops.
///
/// # Errors
/// If the exporter cannot be built.
pub fn init(config: &MetricsConfig) -> anyhow::Result<Option<SdkMeterProvider>> {
    if !config.enabled {
        return Ok(None);
    }

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(config.endpoint.as_str())
        .build()
        .map_err(|err| anyhow::anyhow!("Unable to build OTLP exporter for {}: {err}", config.endpoint))?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter).build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();

    opentelemetry::global::set_meter_provider(provider.clone());

    Ok(Some(provider))
}
