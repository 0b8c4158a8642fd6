/*!
 * Gateway wiring.
 *
 * [`Gateway::start`] builds the registry, the network manager and the
 * bridge, then spawns the long-lived tasks: link event pump, broker event
 * pump, router and scan driver. Dropping or shutting down the gateway
 * aborts them.
 */
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use withub_core::config::Config;
use withub_devices::{ConnectWorkflow, DeviceRegistry, RadioStack, ScanOrchestrator, ScanSchedule};

use crate::bridge::{Bridge, BridgeSink, TopicLayout};
use crate::broker::{BrokerClient, BrokerEvent};
use crate::channel::MessageReceiver;
use crate::error::Result;
use crate::link::{LinkEvent, NetworkLink};
use crate::network::NetworkManager;

/// The external pieces a gateway is assembled from
#[derive(Debug)]
pub struct Collaborators {
    /// Peripheral radio
    pub radio: Arc<dyn RadioStack>,
    /// Network link
    pub link: Arc<dyn NetworkLink>,
    /// Events of `link`
    pub link_events: mpsc::Receiver<LinkEvent>,
    /// Broker client
    pub broker: Arc<dyn BrokerClient>,
    /// Session events of `broker`
    pub broker_events: mpsc::Receiver<BrokerEvent>,
    /// Inbound messages of `broker`
    pub messages: MessageReceiver,
}

/// A running gateway
#[derive(Debug)]
pub struct Gateway {
    registry: Arc<DeviceRegistry>,
    network: Arc<NetworkManager>,
    bridge: Arc<Bridge>,
    scanner: Arc<ScanOrchestrator>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Gateway {
    /// Assemble the gateway and start its tasks
    ///
    /// When the configuration names an access point it is applied and link
    /// connects are requested in the background until one is accepted.
    pub async fn start(config: &Config, parts: Collaborators) -> Result<Self> {
        let Collaborators {
            radio,
            link,
            mut link_events,
            broker,
            mut broker_events,
            messages,
        } = parts;

        let registry = Arc::new(DeviceRegistry::new(config.ble.max_devices));
        let network = Arc::new(NetworkManager::from_config(config, link));
        network.attach_broker(broker);

        let bridge = Arc::new(Bridge::new(
            network.clone(),
            registry.clone(),
            TopicLayout::from(&config.mqtt),
        ));
        let (sink, forwarder) = BridgeSink::spawn(bridge.clone(), config.mqtt.outbound_queue_depth);
        let workflow = Arc::new(ConnectWorkflow::from_config(
            &config.ble,
            radio,
            registry.clone(),
            Arc::new(sink),
        ));
        let scanner = Arc::new(ScanOrchestrator::new(config.ble.target_name.clone(), workflow));

        let mut tasks = vec![("forwarder", forwarder)];

        let net = network.clone();
        tasks.push((
            "link events",
            tokio::spawn(async move {
                while let Some(event) = link_events.recv().await {
                    net.handle_link_event(event).await;
                }
                debug!("Link event stream closed");
            }),
        ));

        let net = network.clone();
        tasks.push((
            "broker events",
            tokio::spawn(async move {
                while let Some(event) = broker_events.recv().await {
                    net.handle_broker_event(event).await;
                }
                debug!("Broker event stream closed");
            }),
        ));

        let router = bridge.clone();
        tasks.push((
            "router",
            tokio::spawn(async move { router.run_router(messages).await }),
        ));

        let scan = scanner.clone();
        let schedule = ScanSchedule::from(&config.ble);
        tasks.push(("scan", tokio::spawn(async move { scan.run(schedule).await })));

        match &config.wifi.access_point {
            Some(access_point) => {
                network.set_access_point(access_point.clone()).await?;
                network.start_connecting()?;
            }
            None => warn!("No access point configured, waiting for link events"),
        }

        info!(
            "Gateway started for {} (up to {} devices)",
            config.ble.target_name, config.ble.max_devices
        );

        Ok(Self {
            registry,
            network,
            bridge,
            scanner,
            tasks,
        })
    }

    /// The device registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The network state machine
    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    /// The bridge between peripherals and broker
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// The scan orchestrator
    pub fn scanner(&self) -> &Arc<ScanOrchestrator> {
        &self.scanner
    }

    /// Abort every gateway task and wait for them to wind down
    pub async fn shutdown(mut self) {
        info!("Shutting down gateway");
        self.network.shutdown();
        for (name, task) in self.tasks.drain(..) {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Task '{}' ended abnormally: {}", name, e);
                }
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }
}
