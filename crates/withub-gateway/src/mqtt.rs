/*!
 * MQTT broker client backed by rumqttc.
 *
 * Each session gets a fresh client and event loop. The event loop runs on
 * its own task, reporting session changes and pushing inbound publishes
 * into the message channel. A full channel stalls the event loop until the
 * router catches up.
 */
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use withub_core::config::MqttConfig;
use withub_core::deps::uuid::Uuid;
use withub_core::error::Error as CoreError;
use withub_core::types::{PublishMessage, QoS, SubscribeMessage};
use withub_core::utils::with_timeout;

use crate::broker::{BrokerClient, BrokerEvent};
use crate::channel::MessageSender;
use crate::error::{Error, Result};

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 16;

/// Pause after an event loop error before polling again
const POLL_BACKOFF: Duration = Duration::from_secs(1);

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

#[derive(Debug)]
struct Session {
    client: AsyncClient,
    poller: JoinHandle<()>,
}

/// MQTT implementation of [`BrokerClient`]
#[derive(Debug)]
pub struct MqttBroker {
    options: MqttOptions,
    events: mpsc::Sender<BrokerEvent>,
    messages: MessageSender,
    session: Mutex<Option<Session>>,
}

impl MqttBroker {
    /// Create a client for the broker in `config`
    ///
    /// Session changes go to `events`, inbound messages to `messages`.
    pub fn new(
        config: &MqttConfig,
        events: mpsc::Sender<BrokerEvent>,
        messages: MessageSender,
    ) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("withub-{}", Uuid::new_v4().simple()));

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        Self {
            options,
            events,
            messages,
            session: Mutex::new(None),
        }
    }

    fn spawn_poller(&self, mut eventloop: EventLoop) -> JoinHandle<()> {
        let events = self.events.clone();
        let messages = self.messages.clone();

        tokio::spawn(async move {
            let mut connected = false;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            connected = true;
                            let _ = events.send(BrokerEvent::Connected).await;
                        } else {
                            warn!("Broker refused session: {:?}", ack.code);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(
                            "Inbound message on {} ({} bytes)",
                            publish.topic,
                            publish.payload.len()
                        );
                        let message = SubscribeMessage::new(publish.topic, publish.payload);
                        if messages.send(message).await.is_err() {
                            warn!("Router gone, dropping inbound message");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        if connected {
                            connected = false;
                            let _ = events.send(BrokerEvent::Disconnected).await;
                        }
                    }
                    Ok(event) => trace!("MQTT event {:?}", event),
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        if connected {
                            connected = false;
                            let _ = events.send(BrokerEvent::Disconnected).await;
                        }
                        tokio::time::sleep(POLL_BACKOFF).await;
                    }
                }
            }
        })
    }

    async fn client(&self) -> Result<AsyncClient> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or_else(|| Error::invalid_state("broker session not started"))
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!("Broker session already started");
            return Ok(());
        }

        let (host, port) = self.options.broker_address();
        info!("Connecting to mqtt://{}:{}", host, port);
        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let poller = self.spawn_poller(eventloop);
        *session = Some(Session { client, poller });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let session = match self.session.lock().await.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        let client = session.client.clone();
        let disconnect = with_timeout(Duration::from_secs(1), async move {
            client
                .disconnect()
                .await
                .map_err(|e| CoreError::runtime(e.to_string()))
        })
        .await;
        session.poller.abort();

        if let Err(e) = disconnect {
            debug!("Disconnect request not delivered: {}", e);
        }
        info!("Broker session stopped");
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn publish(&self, message: &PublishMessage) -> Result<()> {
        let client = self.client().await?;
        client
            .publish_bytes(
                message.topic.clone(),
                to_mqtt_qos(message.qos),
                message.retain,
                message.payload.clone(),
            )
            .await
            .map_err(|e| Error::broker(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let client = self.client().await?;
        client
            .subscribe(topic, to_mqtt_qos(qos))
            .await
            .map_err(|e| Error::broker(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let client = self.client().await?;
        client.unsubscribe(topic).await.map_err(|e| {
            error!("Failed to unsubscribe from {}: {}", topic, e);
            Error::broker(e.to_string())
        })
    }
}
