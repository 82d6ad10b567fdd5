//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events and spans. Applications that
//! want them printed call [`init_tracing`] once at startup.

use strata_core::{ConfigError, StrataConfig, StrataResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive (e.g. "strata_runtime=debug,info")
    pub log_filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from(&StrataConfig::from_env())
    }
}

/// Filter from the client configuration (`log_filter`, or `STRATA_LOG` via
/// `StrataConfig::from_env`); output format from `STRATA_LOG_JSON`.
impl From<&StrataConfig> for TelemetryConfig {
    fn from(config: &StrataConfig) -> Self {
        Self {
            log_filter: config.log_filter.clone(),
            json: std::env::var("STRATA_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }
}

impl TelemetryConfig {
    pub fn with_filter(filter: impl Into<String>) -> Self {
        Self {
            log_filter: filter.into(),
            ..Self::default()
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed.
pub fn init_tracing(config: &TelemetryConfig) -> StrataResult<bool> {
    let env_filter = EnvFilter::try_new(&config.log_filter).map_err(|e| ConfigError::InvalidValue {
        field: "log_filter".to_string(),
        value: config.log_filter.clone(),
        reason: e.to_string(),
    })?;

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    match installed {
        Ok(()) => {
            tracing::debug!(filter = %config.log_filter, json = config.json, "tracing initialized");
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}
