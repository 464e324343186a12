// Logging bootstrap
//
// Console logging through tracing-subscriber with an EnvFilter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "photoflow_durable=debug")
    pub log_filter: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "photoflow-worker".to_string(),
            log_filter: None,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "photoflow-worker")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter (default: "info")
    /// - `LOG_FORMAT`: "json" for structured output
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "photoflow-worker".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Call once, early in `main`. A second call is ignored.
pub fn init_telemetry(config: TelemetryConfig) {
    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(config.filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(config.filter())
            .boxed()
    };

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        return;
    }

    tracing::debug!(service = %config.service_name, "telemetry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_invalid_filter_falls_back_to_info() {
        let config = TelemetryConfig {
            log_filter: Some("photoflow=loud".to_string()),
            ..Default::default()
        };

        assert_eq!(config.filter().max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_custom_filter() {
        let config = TelemetryConfig {
            log_filter: Some("photoflow_durable=debug".to_string()),
            ..Default::default()
        };

        assert_eq!(config.filter().max_level_hint(), Some(LevelFilter::DEBUG));
    }
}
