//! Logging setup for hosts embedding the runtime
//!
//! The runtime itself only emits `tracing` events. Targets worth knowing:
//!
//! - `glint_ext_host::loader`, `glint_ext_host::manager`: load pass and hook outcomes
//! - `glint::extension`: messages logged by extensions through their logger
//!
//! ```ignore
//! glint_ext_host::telemetry::init_subscriber();
//! // RUST_LOG=glint::extension=debug,glint_ext_host=info
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when neither the config nor `RUST_LOG` sets one
pub const DEFAULT_FILTER: &str = "info";

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directives such as `"debug"` or `"glint::extension=trace"`
    ///
    /// `None` falls back to `RUST_LOG`, then to [`DEFAULT_FILTER`].
    pub filter: Option<String>,
    pub format: TelemetryFormat,
    pub timestamps: bool,
    pub target: bool,
    pub thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: None,
            format: TelemetryFormat::Pretty,
            timestamps: true,
            target: true,
            thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_format(mut self, format: TelemetryFormat) -> Self {
        self.format = format;
        self
    }

    /// The filter this config resolves to right now
    pub fn env_filter(&self) -> EnvFilter {
        match &self.filter {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        }
    }
}

/// Install a global subscriber with default settings
///
/// Does nothing if a subscriber is already installed.
pub fn init_subscriber() {
    if let Err(e) = init_with_config(&TelemetryConfig::default()) {
        tracing::debug!(error = %e, "Subscriber already installed");
    }
}

/// Install a global subscriber for `config`
///
/// Fails if one is already installed.
pub fn init_with_config(config: &TelemetryConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(fmt_layer(config))
        .try_init()
}

fn fmt_layer<S>(config: &TelemetryConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.target)
        .with_thread_ids(config.thread_ids);

    match (config.format, config.timestamps) {
        (TelemetryFormat::Pretty, true) => layer.pretty().boxed(),
        (TelemetryFormat::Pretty, false) => layer.pretty().without_time().boxed(),
        (TelemetryFormat::Compact, true) => layer.compact().boxed(),
        (TelemetryFormat::Compact, false) => layer.compact().without_time().boxed(),
        (TelemetryFormat::Json, true) => layer.json().boxed(),
        (TelemetryFormat::Json, false) => layer.json().without_time().boxed(),
    }
}
