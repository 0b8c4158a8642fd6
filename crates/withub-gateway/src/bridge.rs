/*!
 * Bridge between peripherals and the broker.
 *
 * Outbound, every notification becomes a message on
 * `<prefix>/<hex address>/<data suffix>`. Inbound, the second non-empty
 * segment of a topic names the peripheral a payload is written to. Both
 * directions are best effort: failures are logged and the message dropped.
 */
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use withub_core::config::MqttConfig;
use withub_core::types::{DeviceAddress, PublishMessage, SubscribeMessage};
use withub_devices::radio::NotificationSink;
use withub_devices::DeviceRegistry;

use crate::channel::MessageReceiver;
use crate::error::{Error, Result};
use crate::network::NetworkManager;

/// How broker topics are spelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    /// Leading topic segments, e.g. `/wit`
    pub prefix: String,
    /// Trailing segment of outbound data topics
    pub data_suffix: String,
    /// Trailing segment of inbound control topics
    pub control_suffix: String,
}

impl TopicLayout {
    /// Topic sensor data of `address` is published on
    pub fn data_topic(&self, address: DeviceAddress) -> String {
        format!("{}/{}/{}", self.prefix, address.to_hex(), self.data_suffix)
    }

    /// Topic commands for `address` are expected on
    pub fn control_topic(&self, address: DeviceAddress) -> String {
        format!("{}/{}/{}", self.prefix, address.to_hex(), self.control_suffix)
    }
}

impl From<&MqttConfig> for TopicLayout {
    fn from(config: &MqttConfig) -> Self {
        Self {
            prefix: config.topic_prefix.clone(),
            data_suffix: config.data_suffix.clone(),
            control_suffix: config.control_suffix.clone(),
        }
    }
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self::from(&MqttConfig::default())
    }
}

/// Extract the peripheral address from an inbound topic
///
/// Empty segments are skipped, so `/wit/aabbccddeeff/control` and
/// `wit/aabbccddeeff` both name `aa:bb:cc:dd:ee:ff`. Only the second segment
/// is checked.
pub fn parse_control_topic(topic: &str) -> Result<DeviceAddress> {
    let mut segments = topic.split('/').filter(|s| !s.is_empty());
    let address = segments
        .nth(1)
        .ok_or_else(|| Error::invalid_topic(format!("{:?} has fewer than two segments", topic)))?;

    DeviceAddress::from_hex(address)
        .map_err(|e| Error::invalid_topic(format!("{:?}: {}", topic, e)))
}

/// Translates between peripheral notifications and broker messages
#[derive(Debug)]
pub struct Bridge {
    network: Arc<NetworkManager>,
    registry: Arc<DeviceRegistry>,
    topics: TopicLayout,
    runtime: Handle,
}

impl Bridge {
    /// Create a bridge; must be called from within a tokio runtime
    pub fn new(
        network: Arc<NetworkManager>,
        registry: Arc<DeviceRegistry>,
        topics: TopicLayout,
    ) -> Self {
        Self {
            network,
            registry,
            topics,
            runtime: Handle::current(),
        }
    }

    /// The topic layout in use
    pub fn topics(&self) -> &TopicLayout {
        &self.topics
    }

    /// Publish a notification of `address`
    ///
    /// Uses qos 0 without retain. A failure is logged and returned; the
    /// payload is not kept.
    pub async fn forward_to_broker(&self, address: DeviceAddress, payload: Bytes) -> Result<()> {
        let message = PublishMessage::new(self.topics.data_topic(address), payload);
        debug!("Forwarding {} bytes to {}", message.payload.len(), message.topic);

        self.network.publish(message).await.map_err(|e| {
            debug!("Dropped notification of {}: {}", address, e);
            e
        })
    }

    /// Write an inbound message to the peripheral its topic names
    pub async fn route_to_device(&self, message: &SubscribeMessage) -> Result<()> {
        let address = parse_control_topic(&message.topic).map_err(|e| {
            warn!("Dropping message: {}", e);
            e
        })?;

        let device = self.registry.ready_device(address).map_err(|e| {
            warn!("Dropping message for {}: {}", address, e);
            Error::from(e)
        })?;

        device.write_command(&message.payload).await.map_err(|e| {
            warn!("Write to {} failed: {}", address, e);
            Error::from(e)
        })?;

        debug!("Wrote {} bytes to {}", message.payload.len(), address);
        Ok(())
    }

    /// Route inbound messages until every sender is gone
    pub async fn run_router(&self, mut messages: MessageReceiver) {
        info!("Router started");
        while let Some(message) = messages.recv().await {
            // failures are already logged
            let _ = self.route_to_device(&message).await;
        }
        info!("Router stopped");
    }
}

/// Queue depth of a [`BridgeSink`] when the configuration does not say otherwise
pub const DEFAULT_OUTBOUND_DEPTH: usize = 64;

/// Hands notifications to a single forwarder task
///
/// The radio's notification context never waits on the broker. Payloads are
/// published in arrival order; once the queue is full new ones are dropped.
#[derive(Debug, Clone)]
pub struct BridgeSink {
    queue: mpsc::Sender<(DeviceAddress, Bytes)>,
}

impl BridgeSink {
    /// Start the forwarder of `bridge` with room for `depth` pending payloads
    ///
    /// The forwarder stops once every clone of the sink is dropped.
    pub fn spawn(bridge: Arc<Bridge>, depth: usize) -> (Self, JoinHandle<()>) {
        let (queue, mut pending) = mpsc::channel::<(DeviceAddress, Bytes)>(depth.max(1));
        let runtime = bridge.runtime.clone();
        let forwarder = runtime.spawn(async move {
            while let Some((address, payload)) = pending.recv().await {
                // failures are already logged
                let _ = bridge.forward_to_broker(address, payload).await;
            }
            debug!("Forwarder stopped");
        });
        (Self { queue }, forwarder)
    }
}

impl NotificationSink for BridgeSink {
    fn on_notification(&self, address: DeviceAddress, payload: Bytes) {
        match self.queue.try_send((address, payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping notification of {}", address)
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Forwarder gone, dropping notification of {}", address)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let topics = TopicLayout::default();
        let address = DeviceAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(topics.data_topic(address), "/wit/aabbccddeeff/data");
        assert_eq!(topics.control_topic(address), "/wit/aabbccddeeff/control");
    }

    #[test]
    fn test_parse_control_topic() {
        let expected = DeviceAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(parse_control_topic("/wit/aabbccddeeff/control").unwrap(), expected);
        assert_eq!(parse_control_topic("wit/aabbccddeeff").unwrap(), expected);
        assert_eq!(parse_control_topic("/wit/AABBCCDDEEFF/anything").unwrap(), expected);
    }

    #[test]
    fn test_parse_control_topic_rejects() {
        for topic in [
            "/bad",
            "",
            "/",
            "/wit/aabbccddeef/control",
            "/wit/aabbccddeeff00/control",
            "/wit/aabbccddeegg/control",
            "/wit//",
        ] {
            assert!(
                matches!(parse_control_topic(topic), Err(Error::InvalidTopic(_))),
                "{:?} should be rejected",
                topic
            );
        }
    }
}
