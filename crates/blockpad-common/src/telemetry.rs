//! Telemetry setup for blockpad hosts.
//!
//! Provides:
//! - Tracing with compact console output filtered by `RUST_LOG`
//! - Prometheus metrics recorder (feature `telemetry`)
//!
//! # Usage
//!
//! ```ignore
//! use blockpad_common::telemetry::{self, TelemetryConfig};
//!
//! telemetry::init(TelemetryConfig::from_env("blockpad"));
//! tracing::info!("host started");
//!
//! // With the `telemetry` feature, counters recorded by blockpad-sync
//! // can be dumped in prometheus text format.
//! println!("{}", telemetry::render());
//! ```

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for labeling log output
    pub service_name: String,
    /// Console log level (default: INFO, DEBUG in debug builds)
    pub console_level: Level,
    /// Install the prometheus recorder (no-op without the `telemetry` feature)
    pub metrics: bool,
}

impl TelemetryConfig {
    /// Defaults for a service. `RUST_LOG`, when set, overrides `console_level`.
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let console_level = if cfg!(debug_assertions) {
            Level::DEBUG
        } else {
            Level::INFO
        };

        Self {
            service_name: service_name.into(),
            console_level,
            metrics: cfg!(feature = "telemetry"),
        }
    }
}

/// Initialize telemetry (tracing + optional metrics).
///
/// Call once at startup. A second call leaves the first subscriber in place.
pub fn init(config: TelemetryConfig) {
    if config.metrics {
        init_metrics();
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.console_level.as_str().to_lowercase()));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_filter(env_filter);

    if tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!(service = %config.service_name, "telemetry initialized");
    }
}

#[cfg(feature = "telemetry")]
mod prometheus {
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
    use std::sync::OnceLock;

    static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

    pub(super) fn handle() -> Option<&'static PrometheusHandle> {
        PROMETHEUS_HANDLE
            .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install prometheus recorder");
                    None
                }
            })
            .as_ref()
    }
}

/// Install the prometheus recorder. Returns false if metrics are unavailable.
pub fn init_metrics() -> bool {
    #[cfg(feature = "telemetry")]
    {
        prometheus::handle().is_some()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        false
    }
}

/// Render recorded metrics in prometheus text format.
///
/// Empty when the `telemetry` feature is off or no recorder is installed.
pub fn render() -> String {
    #[cfg(feature = "telemetry")]
    {
        prometheus::handle()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        String::new()
    }
}
