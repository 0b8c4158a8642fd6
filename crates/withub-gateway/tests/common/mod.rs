//! Fakes shared by the gateway integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use withub_core::types::{AccessPoint, DeviceAddress, PublishMessage, QoS};
use withub_devices::testing::{FakeRadio, PeripheralBehavior, RecordingSink};
use withub_devices::{ConnectWorkflow, DeviceRegistry, DeviceState, Reservation};
use withub_gateway::{BrokerClient, BrokerEvent, Error, LinkEvent, NetworkLink, Result};

pub const SENSOR: DeviceAddress = DeviceAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Network link that records requests and optionally reports progress
#[derive(Debug, Default)]
pub struct FakeLink {
    connects: Mutex<Vec<AccessPoint>>,
    disconnects: AtomicU32,
    failing: AtomicBool,
    events: Option<mpsc::Sender<LinkEvent>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link that reports link-up and address-acquired on every connect
    pub fn with_events(events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.connects).len()
    }

    pub fn connected_to(&self) -> Vec<AccessPoint> {
        lock(&self.connects).clone()
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkLink for FakeLink {
    async fn connect(&self, access_point: &AccessPoint) -> Result<()> {
        lock(&self.connects).push(access_point.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::link("no such network"));
        }
        if let Some(events) = &self.events {
            let _ = events.send(LinkEvent::LinkUp).await;
            let _ = events.send(LinkEvent::AddressAcquired).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Broker client that records every request
#[derive(Debug, Default)]
pub struct FakeBroker {
    starts: AtomicU32,
    stops: AtomicU32,
    reconnects: AtomicU32,
    published: Mutex<Vec<PublishMessage>>,
    subscribed: Mutex<Vec<(String, QoS)>>,
    unsubscribed: Mutex<Vec<String>>,
    refused_topics: Mutex<HashSet<String>>,
    refuse_publish: AtomicBool,
    publish_delay: Mutex<Option<(u8, Duration)>>,
    events: Option<mpsc::Sender<BrokerEvent>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that reports a session as soon as it is started
    pub fn with_events(events: mpsc::Sender<BrokerEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn refuse_topic(&self, topic: &str) {
        lock(&self.refused_topics).insert(topic.to_string());
    }

    pub fn refuse_publish(&self, refuse: bool) {
        self.refuse_publish.store(refuse, Ordering::SeqCst);
    }

    /// Hold publishes whose payload starts with `first_byte` for `delay`
    pub fn delay_publish(&self, first_byte: u8, delay: Duration) {
        *lock(&self.publish_delay) = Some((first_byte, delay));
    }

    /// First payload byte of every published message, in publish order
    pub fn published_bytes(&self) -> Vec<u8> {
        lock(&self.published)
            .iter()
            .filter_map(|m| m.payload.first().copied())
            .collect()
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishMessage> {
        lock(&self.published).clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        lock(&self.subscribed).iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.unsubscribed).clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(events) = &self.events {
            let _ = events.send(BrokerEvent::Connected).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: &PublishMessage) -> Result<()> {
        if self.refuse_publish.load(Ordering::SeqCst) {
            return Err(Error::broker("negative message id"));
        }
        let delay = *lock(&self.publish_delay);
        if let Some((first_byte, delay)) = delay {
            if message.payload.first() == Some(&first_byte) {
                tokio::time::sleep(delay).await;
            }
        }
        lock(&self.published).push(message.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        if lock(&self.refused_topics).contains(topic) {
            return Err(Error::broker("negative message id"));
        }
        lock(&self.subscribed).push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        lock(&self.unsubscribed).push(topic.to_string());
        Ok(())
    }
}

/// A registry holding `address` in the `Ready` state, plus the fake radio behind it
pub async fn ready_registry(address: DeviceAddress) -> (Arc<DeviceRegistry>, Arc<FakeRadio>) {
    let radio = Arc::new(FakeRadio::new().with_peripheral(address, PeripheralBehavior::default()));
    let registry = Arc::new(DeviceRegistry::new(12));
    let workflow = ConnectWorkflow::new(radio.clone(), registry.clone(), Arc::new(RecordingSink::new()));

    assert_eq!(registry.reserve_or_get(address).unwrap(), Reservation::Claimed);
    assert_eq!(workflow.run(address).await, DeviceState::Ready);
    (registry, radio)
}

/// Poll `check` every 10 ms until it holds or `limit` passes
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
