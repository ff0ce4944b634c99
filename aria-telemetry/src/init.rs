//! Telemetry initialization and configuration

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed.
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// Another global subscriber was installed first.
    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable, one event per line.
    #[default]
    Pretty,
    /// Newline-delimited JSON.
    Json,
}

/// Settings for [`init_with_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Recorded on the first log line so multi-process logs can be told apart.
    pub service_name: String,
    /// Line format.
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl TelemetryConfig {
    /// Pretty output at `info` level.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            format: LogFormat::Pretty,
            default_filter: "info".to_string(),
        }
    }

    /// Switch to JSON output.
    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    /// Set the fallback filter directive (e.g. `"aria_realtime=debug,info"`).
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Initialize console logging with the default settings.
///
/// Calling this more than once is harmless; only the first call installs a
/// subscriber.
///
/// # Example
/// ```
/// use aria_telemetry::init_telemetry;
/// init_telemetry("voice-console").expect("telemetry");
/// ```
pub fn init_telemetry(service_name: &str) -> Result<(), TelemetryError> {
    init_with_config(&TelemetryConfig::new(service_name))
}

/// Initialize logging from an explicit [`TelemetryConfig`].
pub fn init_with_config(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| TelemetryError::Filter(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true))
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).try_init(),
    };
    installed.map_err(|e| TelemetryError::Init(e.to_string()))?;
    INITIALIZED.store(true, Ordering::Release);

    tracing::info!(
        service.name = %config.service_name,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}
