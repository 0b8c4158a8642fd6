/*!
 * Bluetooth Low Energy radio backed by btleplug.
 */
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use withub_core::types::DeviceAddress;

use crate::device::{DeviceError, Result};
use crate::radio::{
    AttributeHandle, DiscoveryEvent, NotificationCallback, Peripheral, RadioStack, ServiceHandle,
};

fn radio_error(e: btleplug::Error) -> DeviceError {
    DeviceError::radio(e.to_string())
}

/// Radio using the first adapter of the host
pub struct BtleRadio {
    adapter: Adapter,
}

impl fmt::Debug for BtleRadio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleRadio").finish_non_exhaustive()
    }
}

impl BtleRadio {
    /// Open the first adapter reported by the platform
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(radio_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_error)?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::radio("No Bluetooth adapter found"))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => warn!("Could not query adapter info: {}", e),
        }
        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    async fn find(&self, address: DeviceAddress) -> Result<PlatformPeripheral> {
        let target = BDAddr::from(*address.as_bytes());
        self.adapter
            .peripherals()
            .await
            .map_err(radio_error)?
            .into_iter()
            .find(|p| p.address() == target)
            .ok_or(DeviceError::NotFound(address))
    }

    async fn report(&self, event: CentralEvent) -> Option<DiscoveryEvent> {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => return None,
        };
        let peripheral = self.adapter.peripheral(&id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        Some(DiscoveryEvent {
            name: properties.local_name,
            address: DeviceAddress::new(properties.address.into_inner()),
            rssi: properties.rssi,
        })
    }
}

#[async_trait]
impl RadioStack for BtleRadio {
    async fn scan(&self, window: Duration, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let mut stream = self.adapter.events().await.map_err(radio_error)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(radio_error)?;

        let deadline = Instant::now() + window;
        while let Ok(Some(event)) = timeout_at(deadline, stream.next()).await {
            if let Some(discovery) = self.report(event).await {
                trace!("Advertisement {:?}", discovery);
                if events.send(discovery).await.is_err() {
                    break;
                }
            }
        }

        self.adapter.stop_scan().await.map_err(radio_error)
    }

    async fn connect(&self, address: DeviceAddress) -> Result<Arc<dyn Peripheral>> {
        let peripheral = self.find(address).await?;

        let connected = peripheral.is_connected().await.unwrap_or(false);
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|e| DeviceError::connection(address, e.to_string()))?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(|e| DeviceError::connection(address, e.to_string()))?;

        Ok(Arc::new(BtlePeripheral {
            address,
            peripheral,
            notifiers: Mutex::new(Vec::new()),
        }))
    }
}

/// A connected btleplug peripheral
pub struct BtlePeripheral {
    address: DeviceAddress,
    peripheral: PlatformPeripheral,
    notifiers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for BtlePeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtlePeripheral")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BtlePeripheral {
    fn characteristic(&self, attribute: &AttributeHandle) -> Option<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == attribute.uuid && c.service_uuid == attribute.service)
    }

    fn abort_notifiers(&self) {
        if let Ok(mut notifiers) = self.notifiers.lock() {
            for notifier in notifiers.drain(..) {
                notifier.abort();
            }
        }
    }
}

impl Drop for BtlePeripheral {
    fn drop(&mut self) {
        self.abort_notifiers();
    }
}

#[async_trait]
impl Peripheral for BtlePeripheral {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn service(&self, uuid: Uuid) -> Result<ServiceHandle> {
        self.peripheral
            .services()
            .iter()
            .find(|s| s.uuid == uuid)
            .map(|s| ServiceHandle { uuid: s.uuid })
            .ok_or(DeviceError::ServiceNotFound(uuid))
    }

    async fn attribute(&self, service: &ServiceHandle, uuid: Uuid) -> Result<AttributeHandle> {
        let services = self.peripheral.services();
        let found = services
            .iter()
            .find(|s| s.uuid == service.uuid)
            .ok_or(DeviceError::ServiceNotFound(service.uuid))?;

        for c in &found.characteristics {
            debug!("Attribute {} properties {:?}", c.uuid, c.properties);
        }

        found
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| AttributeHandle {
                service: service.uuid,
                uuid: c.uuid,
            })
            .ok_or(DeviceError::AttributeNotFound {
                service: service.uuid,
                attribute: uuid,
            })
    }

    async fn subscribe(
        &self,
        attribute: &AttributeHandle,
        callback: NotificationCallback,
    ) -> Result<()> {
        let characteristic =
            self.characteristic(attribute)
                .ok_or(DeviceError::AttributeNotFound {
                    service: attribute.service,
                    attribute: attribute.uuid,
                })?;

        let failure = |e: btleplug::Error| DeviceError::SubscribeFailure {
            attribute: attribute.uuid,
            reason: e.to_string(),
        };
        let mut notifications = self.peripheral.notifications().await.map_err(failure)?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(failure)?;

        let uuid = attribute.uuid;
        let notifier = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    callback(&notification.value);
                }
            }
        });

        self.notifiers
            .lock()
            .map_err(|_| DeviceError::Other("Failed to acquire notifier lock".to_string()))?
            .push(notifier);
        Ok(())
    }

    async fn read(&self, attribute: &AttributeHandle) -> Result<Bytes> {
        let characteristic =
            self.characteristic(attribute)
                .ok_or(DeviceError::AttributeNotFound {
                    service: attribute.service,
                    attribute: attribute.uuid,
                })?;
        self.peripheral
            .read(&characteristic)
            .await
            .map(Bytes::from)
            .map_err(|e| DeviceError::ReadFailure {
                attribute: attribute.uuid,
                reason: e.to_string(),
            })
    }

    async fn write(
        &self,
        attribute: &AttributeHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let characteristic =
            self.characteristic(attribute)
                .ok_or(DeviceError::AttributeNotFound {
                    service: attribute.service,
                    attribute: attribute.uuid,
                })?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| DeviceError::WriteFailure {
                attribute: attribute.uuid,
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<()> {
        self.abort_notifiers();
        self.peripheral.disconnect().await.map_err(radio_error)
    }
}
