/*!
 * Broker client boundary.
 *
 * A broker client reports its session state as [`BrokerEvent`]s and pushes
 * inbound messages into a [`MessageSender`](crate::channel::MessageSender).
 */
use std::fmt::Debug;

use async_trait::async_trait;

use withub_core::types::{PublishMessage, QoS};

use crate::error::Result;

/// Session changes reported by a broker client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerEvent {
    /// The broker accepted the session
    Connected,
    /// The session ended
    Disconnected,
}

/// Publish/subscribe broker client
#[async_trait]
pub trait BrokerClient: Send + Sync + Debug {
    /// Start the session
    async fn start(&self) -> Result<()>;

    /// Stop the session
    async fn stop(&self) -> Result<()>;

    /// Re-establish a session that was interrupted
    async fn reconnect(&self) -> Result<()>;

    /// Send one message
    async fn publish(&self, message: &PublishMessage) -> Result<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Drop a topic filter
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}
