/*!
 * Logging functionality for PLMFlow.
 *
 * This module provides tracing setup and span helpers for consistent logging
 * across the PLMFlow crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use crate::types::InsteonAddress;

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info", false)
}

/// Initialize the logging system from the logging section of the configuration
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_with_filter(&config.level, config.json_format)
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` wins over `filter` when it is set.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "plmflow_devices=trace")
/// * `json` - Emit JSON lines instead of human readable output
pub fn init_with_filter(filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let result = if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init()
    };

    result.map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span scoped to a single device
pub fn device_span(address: &InsteonAddress) -> Span {
    tracing::debug_span!("device", address = %address)
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_reports_error() {
        // The first call may already have lost the race against another test.
        let _ = init();
        assert!(init_with_filter("debug", true).is_err());
    }

    #[test]
    fn test_spans_can_be_entered() {
        // Usable whether or not another test installed a subscriber.
        let span = device_span(&InsteonAddress::new(1, 2, 3));
        let _entered = span.enter();
        tracing::debug!("inside device span");

        let span = operation_span("poll", "poller");
        span.in_scope(|| tracing::debug!("inside operation span"));
    }
}
