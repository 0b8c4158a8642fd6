/*!
 * In-memory radio fakes.
 *
 * These stand in for a real radio in unit and integration tests. Behavior is
 * scripted per address and every interaction is recorded for assertions.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use withub_core::types::DeviceAddress;

use crate::device::{DeviceError, Result};
use crate::radio::{
    AttributeHandle, DiscoveryEvent, NotificationCallback, NotificationSink, Peripheral,
    RadioStack, ServiceHandle,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted behavior of a fake peripheral
#[derive(Debug, Clone, Default)]
pub struct PeripheralBehavior {
    /// Number of connect calls that fail before one succeeds
    pub connect_failures: u32,
    /// Time a connect call takes
    pub connect_delay: Duration,
    /// Whether every service lookup fails
    pub missing_service: bool,
    /// Attribute uuids that cannot be resolved
    pub missing_attributes: Vec<Uuid>,
    /// Whether enabling notifications fails
    pub fail_subscribe: bool,
    /// Whether writes fail
    pub fail_write: bool,
}

impl PeripheralBehavior {
    /// A peripheral whose connects never succeed
    pub fn unreachable() -> Self {
        Self {
            connect_failures: u32::MAX,
            ..Self::default()
        }
    }
}

/// A fake connected peripheral
pub struct FakePeripheral {
    address: DeviceAddress,
    behavior: PeripheralBehavior,
    callback: Mutex<Option<NotificationCallback>>,
    subscribed: Mutex<Option<AttributeHandle>>,
    writes: Mutex<Vec<(AttributeHandle, Bytes, bool)>>,
    connected: AtomicBool,
}

impl fmt::Debug for FakePeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakePeripheral")
            .field("address", &self.address)
            .field("behavior", &self.behavior)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl FakePeripheral {
    /// Create a connected fake peripheral
    pub fn new(address: DeviceAddress, behavior: PeripheralBehavior) -> Self {
        Self {
            address,
            behavior,
            callback: Mutex::new(None),
            subscribed: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Deliver a notification to the subscribed callback
    ///
    /// Returns false when nothing is subscribed.
    pub fn notify(&self, data: &[u8]) -> bool {
        match lock(&self.callback).as_ref() {
            Some(callback) => {
                callback(data);
                true
            }
            None => false,
        }
    }

    /// Attribute notifications were enabled on, if any
    pub fn subscribed(&self) -> Option<AttributeHandle> {
        *lock(&self.subscribed)
    }

    /// Payloads written so far, oldest first
    pub fn written(&self) -> Vec<Bytes> {
        lock(&self.writes)
            .iter()
            .map(|(_, data, _)| data.clone())
            .collect()
    }

    /// Every write with its target and acknowledgement mode
    pub fn writes(&self) -> Vec<(AttributeHandle, Bytes, bool)> {
        lock(&self.writes).clone()
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Peripheral for FakePeripheral {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn service(&self, uuid: Uuid) -> Result<ServiceHandle> {
        if self.behavior.missing_service {
            return Err(DeviceError::ServiceNotFound(uuid));
        }
        Ok(ServiceHandle { uuid })
    }

    async fn attribute(&self, service: &ServiceHandle, uuid: Uuid) -> Result<AttributeHandle> {
        if self.behavior.missing_attributes.contains(&uuid) {
            return Err(DeviceError::AttributeNotFound {
                service: service.uuid,
                attribute: uuid,
            });
        }
        Ok(AttributeHandle {
            service: service.uuid,
            uuid,
        })
    }

    async fn subscribe(
        &self,
        attribute: &AttributeHandle,
        callback: NotificationCallback,
    ) -> Result<()> {
        if self.behavior.fail_subscribe {
            return Err(DeviceError::SubscribeFailure {
                attribute: attribute.uuid,
                reason: "rejected by fake".to_string(),
            });
        }
        *lock(&self.callback) = Some(callback);
        *lock(&self.subscribed) = Some(*attribute);
        Ok(())
    }

    async fn read(&self, attribute: &AttributeHandle) -> Result<Bytes> {
        Ok(lock(&self.writes)
            .iter()
            .rev()
            .find(|(target, _, _)| target == attribute)
            .map(|(_, data, _)| data.clone())
            .unwrap_or_default())
    }

    async fn write(
        &self,
        attribute: &AttributeHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        if self.behavior.fail_write || !self.is_connected() {
            return Err(DeviceError::WriteFailure {
                attribute: attribute.uuid,
                reason: "rejected by fake".to_string(),
            });
        }
        lock(&self.writes).push((*attribute, Bytes::copy_from_slice(data), with_response));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.callback) = None;
        Ok(())
    }
}

/// A fake radio with scripted scans and peripherals
#[derive(Debug, Default)]
pub struct FakeRadio {
    behaviors: Mutex<HashMap<DeviceAddress, PeripheralBehavior>>,
    peripherals: Mutex<HashMap<DeviceAddress, Arc<FakePeripheral>>>,
    connect_calls: Mutex<HashMap<DeviceAddress, u32>>,
    scans: Mutex<VecDeque<Vec<DiscoveryEvent>>>,
    scan_count: AtomicU32,
}

impl FakeRadio {
    /// Create a radio that knows no peripherals
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `address` connectable with `behavior`
    pub fn with_peripheral(self, address: DeviceAddress, behavior: PeripheralBehavior) -> Self {
        self.set_behavior(address, behavior);
        self
    }

    /// Replace the behavior of `address`
    pub fn set_behavior(&self, address: DeviceAddress, behavior: PeripheralBehavior) {
        lock(&self.behaviors).insert(address, behavior);
    }

    /// Queue the advertisements reported by the next scan window
    pub fn queue_scan(&self, events: Vec<DiscoveryEvent>) {
        lock(&self.scans).push_back(events);
    }

    /// Number of connect calls made for `address`
    pub fn connect_calls(&self, address: DeviceAddress) -> u32 {
        lock(&self.connect_calls).get(&address).copied().unwrap_or(0)
    }

    /// The most recently connected peripheral at `address`
    pub fn peripheral(&self, address: DeviceAddress) -> Option<Arc<FakePeripheral>> {
        lock(&self.peripherals).get(&address).cloned()
    }

    /// Number of scan windows run
    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioStack for FakeRadio {
    async fn scan(&self, window: Duration, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        let batch = lock(&self.scans).pop_front().unwrap_or_default();
        for event in batch {
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
        tokio::time::sleep(window).await;
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<Arc<dyn Peripheral>> {
        let call = {
            let mut calls = lock(&self.connect_calls);
            let count = calls.entry(address).or_insert(0);
            *count += 1;
            *count
        };

        let behavior = lock(&self.behaviors)
            .get(&address)
            .cloned()
            .ok_or_else(|| DeviceError::connection(address, "no such peripheral"))?;

        if !behavior.connect_delay.is_zero() {
            tokio::time::sleep(behavior.connect_delay).await;
        }
        if call <= behavior.connect_failures {
            return Err(DeviceError::connection(address, "refused by fake"));
        }

        let peripheral = Arc::new(FakePeripheral::new(address, behavior));
        lock(&self.peripherals).insert(address, peripheral.clone());
        Ok(peripheral)
    }
}

/// A sink that keeps every notification it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<(DeviceAddress, Bytes)>>,
}

impl RecordingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far, oldest first
    pub fn received(&self) -> Vec<(DeviceAddress, Bytes)> {
        lock(&self.received).clone()
    }
}

impl NotificationSink for RecordingSink {
    fn on_notification(&self, address: DeviceAddress, payload: Bytes) {
        lock(&self.received).push((address, payload));
    }
}
