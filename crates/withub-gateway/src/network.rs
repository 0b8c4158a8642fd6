/*!
 * Network connection state machine.
 *
 * [`NetworkManager`] tracks link, address and broker readiness from the
 * events of the network link and the broker client, keeps the subscription
 * set, runs the reconnect loop and gates publishing on readiness.
 *
 * ```text
 * Disconnected --link up--> LinkUp --address acquired--> Ready
 *       ^                                                  |
 *       +------------------- address lost -----------------+
 * ```
 *
 * Link loss alone does not leave `Ready`: the address flag is cleared only by
 * an explicit address-lost event.
 */
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use withub_core::config::Config;
use withub_core::logging::component_span;
use withub_core::types::{AccessPoint, PublishMessage, QoS};
use withub_core::utils::RetryPolicy;

use crate::broker::{BrokerClient, BrokerEvent};
use crate::error::{Error, Result};
use crate::link::{LinkEvent, NetworkLink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coarse network phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkPhase {
    /// No address
    Disconnected,
    /// Associated, waiting for an address
    LinkUp,
    /// Address acquired
    Ready,
}

impl fmt::Display for NetworkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkPhase::Disconnected => "disconnected",
            NetworkPhase::LinkUp => "link up",
            NetworkPhase::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the readiness flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkState {
    /// Associated with the access point
    pub link_up: bool,
    /// Holding a network address
    pub address_acquired: bool,
    /// A broker client is attached
    pub broker_handle_present: bool,
    /// The broker session is established
    pub broker_connected: bool,
}

impl NetworkState {
    /// Whether messages may be published
    pub fn is_ready(&self) -> bool {
        self.link_up && self.address_acquired && self.broker_handle_present && self.broker_connected
    }

    /// Coarse phase derived from the link and address flags
    pub fn phase(&self) -> NetworkPhase {
        if self.address_acquired {
            NetworkPhase::Ready
        } else if self.link_up {
            NetworkPhase::LinkUp
        } else {
            NetworkPhase::Disconnected
        }
    }
}

/// Owner of the network and broker session state
#[derive(Debug)]
pub struct NetworkManager {
    link: Arc<dyn NetworkLink>,
    broker: RwLock<Option<Arc<dyn BrokerClient>>>,
    access_point: Arc<RwLock<Option<AccessPoint>>>,
    subscriptions: Mutex<BTreeSet<String>>,
    link_up: AtomicBool,
    address_acquired: AtomicBool,
    broker_connected: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_policy: RetryPolicy,
    qos: QoS,
}

impl NetworkManager {
    /// Create a manager with an empty subscription set and a 1 s unlimited reconnect loop
    pub fn new(link: Arc<dyn NetworkLink>) -> Self {
        Self {
            link,
            broker: RwLock::new(None),
            access_point: Arc::new(RwLock::new(None)),
            subscriptions: Mutex::new(BTreeSet::new()),
            link_up: AtomicBool::new(false),
            address_acquired: AtomicBool::new(false),
            broker_connected: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            reconnect_policy: RetryPolicy::forever(Duration::from_secs(1)),
            qos: QoS::AtMostOnce,
        }
    }

    /// Create a manager from the broker and wifi sections of the configuration
    ///
    /// The access point is not applied here, see [`NetworkManager::set_access_point`].
    pub fn from_config(config: &Config, link: Arc<dyn NetworkLink>) -> Self {
        Self::new(link)
            .with_reconnect_policy(config.wifi.reconnect.into())
            .with_qos(config.mqtt.qos)
            .with_subscriptions(config.mqtt.subscriptions.iter().cloned())
    }

    /// Set the reconnect loop policy
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Set the qos used for subscriptions
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Seed the subscription set
    pub fn with_subscriptions<I: IntoIterator<Item = String>>(self, topics: I) -> Self {
        lock(&self.subscriptions).extend(topics.into_iter().filter(|t| !t.is_empty()));
        self
    }

    /// Attach the broker client, replacing any previous one
    pub fn attach_broker(&self, broker: Arc<dyn BrokerClient>) {
        let mut slot = self.broker.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(broker);
        self.broker_connected.store(false, Ordering::SeqCst);
    }

    fn broker(&self) -> Option<Arc<dyn BrokerClient>> {
        self.broker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current readiness flags
    pub fn state(&self) -> NetworkState {
        NetworkState {
            link_up: self.link_up.load(Ordering::SeqCst),
            address_acquired: self.address_acquired.load(Ordering::SeqCst),
            broker_handle_present: self.broker().is_some(),
            broker_connected: self.broker_connected.load(Ordering::SeqCst),
        }
    }

    /// Whether messages may be published
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// The configured access point
    pub fn access_point(&self) -> Option<AccessPoint> {
        self.access_point
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Topics in the subscription set, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).iter().cloned().collect()
    }

    /// Whether the reconnect loop is running
    pub fn is_reconnecting(&self) -> bool {
        lock(&self.reconnect_task)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Set or replace the access point
    ///
    /// A live link is dropped so the next connect uses the new credentials.
    pub async fn set_access_point(&self, access_point: AccessPoint) -> Result<()> {
        access_point.validate().map_err(Error::from_validation)?;
        info!("Access point set to {}", access_point.ssid);
        *self
            .access_point
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(access_point);

        if self.link_up.load(Ordering::SeqCst) {
            info!("Dropping link to apply the new access point");
            self.link.disconnect().await?;
        }
        Ok(())
    }

    /// Ask the link to join the configured access point
    pub async fn connect(&self) -> Result<()> {
        let access_point = self
            .access_point()
            .ok_or_else(|| Error::invalid_state("no access point configured"))?;
        self.link.connect(&access_point).await
    }

    /// Keep requesting a link connection in the background
    ///
    /// Requests follow the reconnect policy and stop once the link accepts
    /// one or an address is acquired.
    pub fn start_connecting(&self) -> Result<()> {
        if self.access_point().is_none() {
            return Err(Error::invalid_state("no access point configured"));
        }
        self.start_reconnect();
        Ok(())
    }

    /// Apply a link event
    pub async fn handle_link_event(&self, event: LinkEvent) {
        debug!("Link event {:?}", event);
        match event {
            LinkEvent::LinkUp => {
                self.link_up.store(true, Ordering::SeqCst);
                info!("Link up");
                // the address survived a short link loss
                if self.address_acquired.load(Ordering::SeqCst) {
                    if let Some(broker) = self.broker() {
                        info!("Reconnecting to broker");
                        if let Err(e) = broker.reconnect().await {
                            error!("Failed to reconnect to broker: {}", e);
                        }
                    }
                }
            }
            LinkEvent::LinkDown => {
                self.link_up.store(false, Ordering::SeqCst);
                info!("Link down");
            }
            LinkEvent::AddressAcquired => {
                self.address_acquired.store(true, Ordering::SeqCst);
                info!("Address acquired");
                self.stop_reconnect();
                match self.broker() {
                    Some(broker) => {
                        info!("Connecting to broker");
                        if let Err(e) = broker.start().await {
                            error!("Failed to connect to broker: {}", e);
                        }
                    }
                    None => warn!("No broker client attached"),
                }
            }
            LinkEvent::AddressLost => {
                self.address_acquired.store(false, Ordering::SeqCst);
                info!("Address lost");
                self.start_reconnect();
                match self.broker() {
                    Some(broker) => {
                        info!("Stopping broker client");
                        if let Err(e) = broker.stop().await {
                            error!("Failed to stop broker client: {}", e);
                        }
                        self.broker_connected.store(false, Ordering::SeqCst);
                    }
                    None => warn!("No broker client attached"),
                }
            }
        }
    }

    /// Apply a broker event
    pub async fn handle_broker_event(&self, event: BrokerEvent) {
        debug!("Broker event {:?}", event);
        match event {
            BrokerEvent::Connected => {
                self.broker_connected.store(true, Ordering::SeqCst);
                info!("Broker connected");
                if let Err(e) = self.do_subscribe().await {
                    error!("Failed to restore subscriptions: {}", e);
                }
            }
            BrokerEvent::Disconnected => {
                self.broker_connected.store(false, Ordering::SeqCst);
                info!("Broker disconnected");
            }
        }
    }

    /// Subscribe every topic of the subscription set
    ///
    /// Every topic is attempted; the ones the broker refused are reported
    /// together.
    pub async fn do_subscribe(&self) -> Result<()> {
        let broker = self
            .broker()
            .ok_or_else(|| Error::invalid_state("no broker client attached"))?;
        if !self.address_acquired.load(Ordering::SeqCst) {
            return Err(Error::invalid_state("no network address"));
        }

        let topics = self.subscriptions();
        let mut failed = Vec::new();
        let mut reason = String::new();
        for topic in topics {
            info!("Subscribing to {}", topic);
            if let Err(e) = broker.subscribe(&topic, self.qos).await {
                warn!("Failed to subscribe to {}: {}", topic, e);
                reason = e.to_string();
                failed.push(topic);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::BrokerSubscribeFailure {
                topics: failed,
                reason,
            })
        }
    }

    /// Add a topic to the subscription set
    ///
    /// The broker is asked right away when the session is ready; otherwise the
    /// topic waits for the next session.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::invalid_topic("empty topic"));
        }
        if !lock(&self.subscriptions).insert(topic.to_string()) {
            debug!("Already subscribed to {}", topic);
            return Ok(());
        }

        if !self.is_ready() {
            debug!("Queued subscription to {}", topic);
            return Ok(());
        }

        let broker = self
            .broker()
            .ok_or_else(|| Error::invalid_state("no broker client attached"))?;
        info!("Subscribing to {}", topic);
        broker
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| Error::BrokerSubscribeFailure {
                topics: vec![topic.to_string()],
                reason: e.to_string(),
            })
    }

    /// Remove a topic from the subscription set and from the broker session
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        lock(&self.subscriptions).remove(topic);
        let broker = self
            .broker()
            .ok_or_else(|| Error::invalid_state("no broker client attached"))?;
        info!("Unsubscribing from {}", topic);
        broker.unsubscribe(topic).await
    }

    /// Send a message to the broker
    pub async fn publish(&self, message: PublishMessage) -> Result<()> {
        let state = self.state();
        if !state.is_ready() {
            return Err(Error::invalid_state(format!(
                "not ready to publish ({}, broker {})",
                state.phase(),
                if state.broker_connected {
                    "connected"
                } else {
                    "disconnected"
                }
            )));
        }

        let broker = self
            .broker()
            .ok_or_else(|| Error::invalid_state("no broker client attached"))?;
        broker
            .publish(&message)
            .await
            .map_err(|e| Error::PublishFailure {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })
    }

    fn start_reconnect(&self) {
        let mut task = lock(&self.reconnect_task);
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            debug!("Reconnect loop already running");
            return;
        }

        let link = self.link.clone();
        let access_point = self.access_point.clone();
        let policy = self.reconnect_policy;
        let span = component_span("reconnect");

        info!("Starting reconnect loop");
        *task = Some(tokio::spawn(
            async move {
                let result = policy
                    .run("reconnect", |_| {
                        let link = link.clone();
                        let current = access_point
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        async move {
                            match current {
                                Some(ap) => link.connect(&ap).await,
                                None => Err(Error::invalid_state("no access point configured")),
                            }
                        }
                    })
                    .await;

                match result {
                    Ok(()) => info!("Reconnect request accepted"),
                    Err(e) => error!("Giving up reconnecting: {}", e),
                }
            }
            .instrument(span),
        ));
    }

    fn stop_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            if !task.is_finished() {
                info!("Stopping reconnect loop");
            }
            task.abort();
        }
    }

    /// Stop background work owned by the manager
    pub fn shutdown(&self) {
        self.stop_reconnect();
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.stop_reconnect();
    }
}
