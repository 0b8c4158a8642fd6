/*!
 * Peripheral connection state and error types.
 *
 * This module defines the lifecycle of a peripheral inside the gateway and
 * the errors raised while discovering, connecting and talking to it.
 */
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use withub_core::error::Error as CoreError;
use withub_core::types::DeviceAddress;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The registry holds as many peripherals as it may
    #[error("Device registry full ({capacity} entries)")]
    CapacityExceeded {
        /// Configured registry capacity
        capacity: usize,
    },

    /// No entry exists for the address
    #[error("Device {0} not found")]
    NotFound(DeviceAddress),

    /// The entry exists but has no usable link yet
    #[error("Device {address} not ready ({state})")]
    NotReady {
        /// The peripheral address
        address: DeviceAddress,
        /// State the entry was found in
        state: DeviceState,
    },

    /// The entry is owned by an in-flight connect workflow
    #[error("Device {0} is busy connecting")]
    Busy(DeviceAddress),

    /// Establishing the link failed
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailure {
        /// The peripheral address
        address: DeviceAddress,
        /// What went wrong
        reason: String,
    },

    /// The expected service is absent
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    /// The expected attribute is absent from the service
    #[error("Attribute {attribute} not found in service {service}")]
    AttributeNotFound {
        /// Service that was searched
        service: Uuid,
        /// Attribute that was looked for
        attribute: Uuid,
    },

    /// Enabling notifications failed
    #[error("Failed to subscribe to {attribute}: {reason}")]
    SubscribeFailure {
        /// Attribute the subscription targeted
        attribute: Uuid,
        /// What went wrong
        reason: String,
    },

    /// Writing to an attribute failed
    #[error("Failed to write {attribute}: {reason}")]
    WriteFailure {
        /// Attribute the write targeted
        attribute: Uuid,
        /// What went wrong
        reason: String,
    },

    /// Reading an attribute failed
    #[error("Failed to read {attribute}: {reason}")]
    ReadFailure {
        /// Attribute the read targeted
        attribute: Uuid,
        /// What went wrong
        reason: String,
    },

    /// The radio stack itself failed
    #[error("Radio error: {0}")]
    Radio(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new radio error
    pub fn radio<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Radio(msg.as_ref().to_string())
    }

    /// Create a new connection failure
    pub fn connection<S: AsRef<str>>(address: DeviceAddress, reason: S) -> Self {
        DeviceError::ConnectionFailure {
            address,
            reason: reason.as_ref().to_string(),
        }
    }
}

/// Lifecycle of a registry entry
///
/// ```text
/// Discovered -> Connecting -> Ready
///                  |   ^
///                  v   | next sighting
///                  Failed
/// ```
///
/// A workflow never retries past `Failed` on its own; the next sighting
/// claims the entry again. `Ready` is terminal and only eviction frees a
/// slot. A disconnect after `Ready` is not tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Seen in a scan, not claimed by a workflow yet
    Discovered,
    /// A connect workflow owns the entry
    Connecting,
    /// Link up, attributes resolved, notifications enabled
    Ready,
    /// The last connect workflow gave up
    Failed,
}

impl DeviceState {
    /// Whether a new connect workflow may claim an entry in this state
    pub fn is_claimable(&self) -> bool {
        matches!(self, DeviceState::Discovered | DeviceState::Failed)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Discovered => "discovered",
            DeviceState::Connecting => "connecting",
            DeviceState::Ready => "ready",
            DeviceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// The peripheral address
    pub address: DeviceAddress,
    /// Current lifecycle state
    pub state: DeviceState,
    /// Reason of the last failure, if any
    pub last_error: Option<String>,
}
