/*!
 * withub Devices
 *
 * This crate discovers supported peripherals, keeps them in a bounded
 * registry and drives each one through its connect workflow. Radio access
 * goes through the traits in [`radio`].
 */

#![warn(missing_docs)]

// Re-export core types
pub use withub_core::prelude;

pub mod connect;
pub mod device;
pub mod discovery;
pub mod radio;
pub mod registry;

// Re-export the main entry points
pub use connect::{AttributeLayout, ConnectWorkflow};
pub use device::{DeviceError, DeviceSnapshot, DeviceState};
pub use discovery::{DiscoveryOutcome, ScanOrchestrator, ScanSchedule};
pub use radio::{DiscoveryEvent, NotificationSink, Peripheral, RadioStack};
pub use registry::{DeviceRegistry, ReadyDevice, RegistryEvent, Reservation};

/// withub devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Conditional compilation for radio-specific modules
#[cfg(feature = "ble")]
pub mod ble;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Initialize the device system
pub fn init() -> Result<(), withub_core::error::Error> {
    tracing::info!("withub devices {} initialized", VERSION);
    Ok(())
}

/// Radio backends compiled into this build
pub fn available_radios() -> Vec<&'static str> {
    let mut radios = Vec::new();

    #[cfg(feature = "ble")]
    radios.push("ble");

    #[cfg(any(test, feature = "testing"))]
    radios.push("fake");

    radios
}
