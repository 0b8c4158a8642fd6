/*!
 * withub Core
 *
 * This crate provides the shared foundation of the withub gateway:
 * configuration, logging, the error type, and the value types exchanged
 * between the radio side and the broker side.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use bytes;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// withub core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("withub core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
