/*!
 * Radio stack abstractions.
 *
 * The gateway talks to peripherals only through the traits in this module.
 * A btleplug backed implementation lives behind the `ble` feature and
 * in-memory fakes behind the `testing` feature.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use withub_core::types::DeviceAddress;

use crate::device::Result;

/// An advertisement seen during a scan window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Hardware address of the advertiser
    pub address: DeviceAddress,
    /// Received signal strength in dBm
    pub rssi: Option<i16>,
}

impl DiscoveryEvent {
    /// Create a new discovery event
    pub fn new<S: Into<String>>(name: Option<S>, address: DeviceAddress) -> Self {
        Self {
            name: name.map(Into::into),
            address,
            rssi: None,
        }
    }

    /// Set the signal strength
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

/// A resolved service on a connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Service uuid
    pub uuid: Uuid,
}

/// A resolved attribute inside a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeHandle {
    /// Owning service uuid
    pub service: Uuid,
    /// Attribute uuid
    pub uuid: Uuid,
}

/// Invoked with the value of every notification of a subscribed attribute
pub type NotificationCallback = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Receives notification payloads together with the address they came from
///
/// Implementations are called from the radio's notification context and
/// must not block.
pub trait NotificationSink: Send + Sync + Debug {
    /// Handle one notification
    fn on_notification(&self, address: DeviceAddress, payload: Bytes);
}

/// Scanning and link establishment
#[async_trait]
pub trait RadioStack: Send + Sync + Debug {
    /// Scan for `window`, pushing every advertisement into `events`
    ///
    /// Returns once the window has elapsed or `events` is closed.
    async fn scan(&self, window: Duration, events: mpsc::Sender<DiscoveryEvent>) -> Result<()>;

    /// Establish a link to the peripheral at `address`
    async fn connect(&self, address: DeviceAddress) -> Result<Arc<dyn Peripheral>>;
}

/// A connected peripheral
#[async_trait]
pub trait Peripheral: Send + Sync + Debug {
    /// Address of the peripheral
    fn address(&self) -> DeviceAddress;

    /// Resolve a service by uuid
    async fn service(&self, uuid: Uuid) -> Result<ServiceHandle>;

    /// Resolve an attribute of `service` by uuid
    async fn attribute(&self, service: &ServiceHandle, uuid: Uuid) -> Result<AttributeHandle>;

    /// Enable notifications on `attribute`, delivering each value to `callback`
    async fn subscribe(&self, attribute: &AttributeHandle, callback: NotificationCallback)
        -> Result<()>;

    /// Read the current value of `attribute`
    async fn read(&self, attribute: &AttributeHandle) -> Result<Bytes>;

    /// Write `data` to `attribute`
    async fn write(&self, attribute: &AttributeHandle, data: &[u8], with_response: bool)
        -> Result<()>;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;
}
