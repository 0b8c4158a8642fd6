/*!
 * withub Gateway
 *
 * This crate relays notifications of connected peripherals to a
 * publish/subscribe broker and routes inbound broker messages back to the
 * peripherals, while tracking network and broker readiness.
 */

#![warn(missing_docs)]

// Re-export core types
pub use withub_core::prelude;

pub mod bridge;
pub mod broker;
pub mod channel;
pub mod error;
pub mod gateway;
pub mod link;
pub mod network;

// Re-export main types for convenience
pub use bridge::{parse_control_topic, Bridge, BridgeSink, TopicLayout};
pub use broker::{BrokerClient, BrokerEvent};
pub use channel::{MessageReceiver, MessageSender};
pub use error::{Error, Result};
pub use gateway::{Collaborators, Gateway};
pub use link::{HostLink, LinkEvent, NetworkLink};
pub use network::{NetworkManager, NetworkPhase, NetworkState};

/// withub gateway crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Conditional compilation for broker-specific modules
#[cfg(feature = "mqtt")]
pub mod mqtt;

/// Initialize the gateway
pub fn init() -> Result<()> {
    tracing::info!("withub gateway {} initialized", VERSION);
    Ok(())
}
