/*!
 * Logging functionality for withub.
 *
 * Tracing setup plus the spans that tag log lines with the peripheral or
 * background loop that produced them.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use crate::types::DeviceAddress;

/// Initialize the logging system at `info`
pub fn init() -> Result<()> {
    install(EnvFilter::new("info"), true)
}

/// Initialize the logging system from the logging section of the configuration
///
/// `RUST_LOG` takes precedence over `config.level` when it is set.
pub fn init_with_config(config: &LoggingConfig) -> Result<()> {
    install(env_or(&config.level), config.show_target)
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "withub_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(env_or(filter), true)
}

fn env_or(filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter))
}

fn install(filter: EnvFilter, show_target: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(show_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// Span returned by the helpers below
pub type Span = tracing::Span;

/// Span for a background loop such as the scanner or the link reconnector
pub fn component_span(name: &str) -> Span {
    tracing::info_span!("component", name = %name)
}

/// Span for work done on behalf of one peripheral
pub fn device_span(name: &str, address: DeviceAddress) -> Span {
    tracing::info_span!("device", name = %name, address = %address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init();
        assert!(init_with_filter("debug").is_err());
        assert!(init_with_config(&LoggingConfig::default()).is_err());
    }

    #[test]
    fn test_spans() {
        let address = DeviceAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let span: Span = device_span("connect", address);
        assert!(span.is_none() || span.metadata().map(|m| m.name()) == Some("device"));

        let span = component_span("reconnect");
        assert!(span.is_none() || span.metadata().map(|m| m.name()) == Some("component"));
    }
}
