/*!
 * Connect workflow.
 *
 * Drives one claimed registry entry from `Connecting` to `Ready` or
 * `Failed`: link up, service and attribute resolution, notification
 * subscription. Every log line of a run is attributed to the peripheral
 * through a device span.
 */
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use withub_core::config::BleConfig;
use withub_core::logging::device_span;
use withub_core::types::DeviceAddress;
use withub_core::utils::RetryPolicy;

use crate::device::{DeviceError, DeviceState, Result};
use crate::radio::{AttributeHandle, NotificationCallback, NotificationSink, Peripheral, RadioStack};
use crate::registry::DeviceRegistry;

/// The service and attributes a supported peripheral exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLayout {
    /// Service holding both attributes
    pub service: Uuid,
    /// Attribute delivering sensor data
    pub notify: Uuid,
    /// Attribute accepting commands
    pub write: Uuid,
}

impl From<&BleConfig> for AttributeLayout {
    fn from(config: &BleConfig) -> Self {
        Self {
            service: config.service_uuid,
            notify: config.notify_uuid,
            write: config.write_uuid,
        }
    }
}

impl Default for AttributeLayout {
    fn default() -> Self {
        Self::from(&BleConfig::default())
    }
}

/// Sets up one peripheral at a time
#[derive(Debug)]
pub struct ConnectWorkflow {
    radio: Arc<dyn RadioStack>,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn NotificationSink>,
    layout: AttributeLayout,
    retry: RetryPolicy,
    connect_timeout: Duration,
}

impl ConnectWorkflow {
    /// Create a workflow with the default layout, a single attempt and a 10 s link timeout
    pub fn new(
        radio: Arc<dyn RadioStack>,
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            radio,
            registry,
            sink,
            layout: AttributeLayout::default(),
            retry: RetryPolicy::once(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Create a workflow from the radio section of the configuration
    pub fn from_config(
        config: &BleConfig,
        radio: Arc<dyn RadioStack>,
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::new(radio, registry, sink)
            .with_layout(AttributeLayout::from(config))
            .with_retry(config.connect_retry.into())
            .with_connect_timeout(config.connect_timeout())
    }

    /// Set the expected service and attributes
    pub fn with_layout(mut self, layout: AttributeLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the retry policy for a whole setup attempt
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set how long link establishment may take
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// The registry entries are recorded in
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The radio links are established through
    pub fn radio(&self) -> &Arc<dyn RadioStack> {
        &self.radio
    }

    /// Drive the claimed entry for `address` to its final state
    ///
    /// The caller must own the entry, see
    /// [`DeviceRegistry::reserve_or_get`](crate::registry::DeviceRegistry::reserve_or_get).
    pub async fn run(&self, address: DeviceAddress) -> DeviceState {
        let span = device_span("connect", address);
        self.drive(address).instrument(span).await
    }

    async fn drive(&self, address: DeviceAddress) -> DeviceState {
        info!("Connecting to {}", address);

        let result = self
            .retry
            .run("connect", |attempt| self.attempt(address, attempt))
            .await;

        match result {
            Ok(()) => {
                info!("Device {} ready", address);
                DeviceState::Ready
            }
            Err(e) => {
                error!("Failed to set up {}: {}", address, e);
                if let Err(mark) = self.registry.mark_failed(address, &e) {
                    warn!("Could not record failure of {}: {}", address, mark);
                }
                DeviceState::Failed
            }
        }
    }

    async fn attempt(&self, address: DeviceAddress, attempt: u32) -> Result<()> {
        debug!("Connect attempt {} for {}", attempt, address);

        let peripheral = match timeout(self.connect_timeout, self.radio.connect(address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeviceError::connection(
                    address,
                    format!("timed out after {:?}", self.connect_timeout),
                ))
            }
        };

        match self.resolve_and_subscribe(peripheral.as_ref()).await {
            Ok((notify, write)) => self.registry.mark_ready(peripheral, notify, write),
            Err(e) => {
                if let Err(disconnect) = peripheral.disconnect().await {
                    debug!("Disconnect of {} after failed setup: {}", address, disconnect);
                }
                Err(e)
            }
        }
    }

    async fn resolve_and_subscribe(
        &self,
        peripheral: &dyn Peripheral,
    ) -> Result<(AttributeHandle, AttributeHandle)> {
        let address = peripheral.address();

        let service = peripheral.service(self.layout.service).await?;
        debug!("Found service {}", service.uuid);

        let notify = peripheral.attribute(&service, self.layout.notify).await?;
        debug!("Found notify attribute {} in {}", notify.uuid, notify.service);

        let write = peripheral.attribute(&service, self.layout.write).await?;
        debug!("Found write attribute {} in {}", write.uuid, write.service);

        let sink = self.sink.clone();
        let callback: NotificationCallback = Box::new(move |data: &[u8]| {
            sink.on_notification(address, Bytes::copy_from_slice(data));
        });
        peripheral.subscribe(&notify, callback).await?;
        debug!("Subscribed to {}", notify.uuid);

        Ok((notify, write))
    }
}
