/*!
 * Prelude module for withub core.
 *
 * This module re-exports commonly used types and functions from the core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{AccessPoint, DeviceAddress, PublishMessage, QoS, SubscribeMessage};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder};

// Re-export utility functions
pub use crate::utils::{with_timeout, RetryPolicy};

// Re-export logging
pub use crate::logging::{component_span, device_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
