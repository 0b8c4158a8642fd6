/*!
 * Device registry for withub.
 *
 * The registry is the single owner of every known peripheral, keyed by
 * hardware address and bounded by a fixed capacity. Connect workflows claim
 * entries through [`DeviceRegistry::reserve_or_get`], which makes the
 * capacity check, the insertion and the claim one atomic step.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use withub_core::types::DeviceAddress;

use crate::device::{DeviceError, DeviceSnapshot, DeviceState, Result};
use crate::radio::{AttributeHandle, Peripheral};

/// Event types for device registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A peripheral was added to the registry
    DeviceAdded(DeviceAddress),
    /// A peripheral was removed from the registry
    DeviceRemoved(DeviceAddress),
    /// A peripheral changed state
    DeviceStateChanged {
        /// The peripheral address
        address: DeviceAddress,
        /// The old state
        old_state: DeviceState,
        /// The new state
        new_state: DeviceState,
    },
}

/// Outcome of [`DeviceRegistry::reserve_or_get`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller now owns the entry, which is in `Connecting`
    Claimed,
    /// The entry already exists, in the given state
    Existing(DeviceState),
}

/// A peripheral with a live link and resolved attributes
///
/// Cloning shares the underlying link, the registry stays the owner.
#[derive(Debug, Clone)]
pub struct ReadyDevice {
    /// The peripheral address
    pub address: DeviceAddress,
    /// The connected peripheral
    pub peripheral: Arc<dyn Peripheral>,
    /// Attribute delivering sensor data
    pub notify_attribute: AttributeHandle,
    /// Attribute accepting commands
    pub write_attribute: AttributeHandle,
}

impl ReadyDevice {
    /// Write a command to the write attribute, waiting for the acknowledgement
    pub async fn write_command(&self, data: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.write_attribute, data, true)
            .await
    }
}

#[derive(Debug)]
struct Entry {
    state: DeviceState,
    last_error: Option<String>,
    link: Option<ReadyDevice>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: DeviceState::Discovered,
            last_error: None,
            link: None,
        }
    }

    fn snapshot(&self, address: DeviceAddress) -> DeviceSnapshot {
        DeviceSnapshot {
            address,
            state: self.state,
            last_error: self.last_error.clone(),
        }
    }
}

/// Bounded table of known peripherals
#[derive(Debug)]
pub struct DeviceRegistry {
    /// The known peripherals
    devices: RwLock<HashMap<DeviceAddress, Entry>>,
    /// Maximum number of entries
    capacity: usize,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new registry holding at most `capacity` peripherals
    pub fn new(capacity: usize) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
            event_sender,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<DeviceAddress, Entry>>> {
        self.devices.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<DeviceAddress, Entry>>> {
        self.devices.write().map_err(|_| {
            DeviceError::Other("Failed to acquire write lock on device registry".to_string())
        })
    }

    fn emit(&self, event: RegistryEvent) {
        // no receivers is not an error
        let _ = self.event_sender.send(event);
    }

    fn transition(&self, address: DeviceAddress, entry: &mut Entry, new_state: DeviceState) {
        let old_state = entry.state;
        entry.state = new_state;
        debug!("Device {} {} -> {}", address, old_state, new_state);
        self.emit(RegistryEvent::DeviceStateChanged {
            address,
            old_state,
            new_state,
        });
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries, whatever their state
    pub fn len(&self) -> usize {
        self.read().map(|devices| devices.len()).unwrap_or(0)
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up or create the entry for `address` and try to claim it
    ///
    /// A new entry is inserted as `Discovered` when there is room and
    /// claimed right away, which moves it to `Connecting`. A `Failed` entry
    /// is claimed again and loses its last error. `Connecting` and `Ready`
    /// entries are reported back untouched. All of this happens under one lock, so
    /// two discoveries of the same address never both receive
    /// [`Reservation::Claimed`].
    pub fn reserve_or_get(&self, address: DeviceAddress) -> Result<Reservation> {
        let mut devices = self.write()?;

        if !devices.contains_key(&address) {
            if devices.len() >= self.capacity {
                return Err(DeviceError::CapacityExceeded {
                    capacity: self.capacity,
                });
            }
            devices.insert(address, Entry::new());
            info!("Registered device {}", address);
            self.emit(RegistryEvent::DeviceAdded(address));
        }

        let entry = match devices.get_mut(&address) {
            Some(entry) => entry,
            None => return Err(DeviceError::NotFound(address)),
        };

        if !entry.state.is_claimable() {
            return Ok(Reservation::Existing(entry.state));
        }

        entry.last_error = None;
        self.transition(address, entry, DeviceState::Connecting);
        Ok(Reservation::Claimed)
    }

    /// Get a snapshot of the entry for `address`
    pub fn find(&self, address: DeviceAddress) -> Result<DeviceSnapshot> {
        let devices = self.read()?;
        devices
            .get(&address)
            .map(|entry| entry.snapshot(address))
            .ok_or(DeviceError::NotFound(address))
    }

    /// Get the live link of a `Ready` peripheral
    pub fn ready_device(&self, address: DeviceAddress) -> Result<ReadyDevice> {
        let devices = self.read()?;
        let entry = devices
            .get(&address)
            .ok_or(DeviceError::NotFound(address))?;

        match (&entry.state, &entry.link) {
            (DeviceState::Ready, Some(link)) => Ok(link.clone()),
            (state, _) => Err(DeviceError::NotReady {
                address,
                state: *state,
            }),
        }
    }

    /// Record a completed connect workflow
    ///
    /// Only the owner of a `Connecting` entry may call this.
    pub fn mark_ready(
        &self,
        peripheral: Arc<dyn Peripheral>,
        notify_attribute: AttributeHandle,
        write_attribute: AttributeHandle,
    ) -> Result<()> {
        let address = peripheral.address();
        let mut devices = self.write()?;
        let entry = devices
            .get_mut(&address)
            .ok_or(DeviceError::NotFound(address))?;

        if entry.state != DeviceState::Connecting {
            return Err(DeviceError::NotReady {
                address,
                state: entry.state,
            });
        }

        entry.link = Some(ReadyDevice {
            address,
            peripheral,
            notify_attribute,
            write_attribute,
        });
        self.transition(address, entry, DeviceState::Ready);
        Ok(())
    }

    /// Record an abandoned connect workflow
    pub fn mark_failed(&self, address: DeviceAddress, reason: &DeviceError) -> Result<()> {
        let mut devices = self.write()?;
        let entry = devices
            .get_mut(&address)
            .ok_or(DeviceError::NotFound(address))?;

        if entry.state != DeviceState::Connecting {
            return Err(DeviceError::NotReady {
                address,
                state: entry.state,
            });
        }

        entry.link = None;
        entry.last_error = Some(reason.to_string());
        self.transition(address, entry, DeviceState::Failed);
        Ok(())
    }

    /// Remove the entry for `address`, freeing its slot
    ///
    /// Entries owned by a connect workflow cannot be removed. Removing a
    /// `Ready` entry drops the registry's handle to the link.
    pub fn evict(&self, address: DeviceAddress) -> Result<DeviceSnapshot> {
        let mut devices = self.write()?;
        match devices.get(&address) {
            None => return Err(DeviceError::NotFound(address)),
            Some(entry) if entry.state == DeviceState::Connecting => {
                return Err(DeviceError::Busy(address));
            }
            Some(_) => {}
        }

        let snapshot = devices
            .remove(&address)
            .map(|entry| entry.snapshot(address))
            .ok_or(DeviceError::NotFound(address))?;
        info!("Evicted device {} ({})", address, snapshot.state);
        self.emit(RegistryEvent::DeviceRemoved(address));
        Ok(snapshot)
    }

    /// Remove every `Failed` entry, returning their addresses
    pub fn evict_failed(&self) -> Result<Vec<DeviceAddress>> {
        let mut devices = self.write()?;
        let failed: Vec<DeviceAddress> = devices
            .iter()
            .filter(|(_, entry)| entry.state == DeviceState::Failed)
            .map(|(address, _)| *address)
            .collect();

        for address in &failed {
            devices.remove(address);
            self.emit(RegistryEvent::DeviceRemoved(*address));
        }

        if !failed.is_empty() {
            warn!("Evicted {} failed device(s)", failed.len());
        }
        Ok(failed)
    }

    /// Snapshots of every entry
    pub fn snapshots(&self) -> Result<Vec<DeviceSnapshot>> {
        let devices = self.read()?;
        Ok(devices
            .iter()
            .map(|(address, entry)| entry.snapshot(*address))
            .collect())
    }

    /// Addresses of every `Ready` entry
    pub fn ready_addresses(&self) -> Result<Vec<DeviceAddress>> {
        let devices = self.read()?;
        Ok(devices
            .iter()
            .filter(|(_, entry)| entry.state == DeviceState::Ready)
            .map(|(address, _)| *address)
            .collect())
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(12)
    }
}
