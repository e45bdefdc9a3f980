pub mod ha_interface;
pub mod tls;

use std::collections::HashSet;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{MeterConfig, MqttConfig};
use crate::models::PublishedReading;
use crate::mqtt::ha_interface::HaSensorDiscover;
use crate::retry::Backoff;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The event loop gave up, e.g. on a TLS handshake failure
    Failed(String),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Broker not connected")]
    NotConnected,
    #[error("Publishing to {0} timed out")]
    Timeout(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Unable to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Broker connection failed permanently: {0}")]
    Fatal(String),
    #[error("Unable to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    /// Misconfiguration that no reconnect will fix
    pub fn is_fatal(&self) -> bool {
        return matches!(self, PublishError::Tls(_) | PublishError::Io { .. } | PublishError::Fatal(_));
    }
}

/// Where the readings of a finished cycle go
#[allow(async_fn_in_trait)]
pub trait ReadingPublisher {
    async fn publish_discovery(&mut self, meter: &MeterConfig) -> Result<(), PublishError>;
    async fn publish_state(&mut self, reading: &PublishedReading) -> Result<(), PublishError>;
}

/// Remembers which meters already got their discovery message in this run.
/// A meter is only marked after its discovery went out.
#[derive(Debug, Default)]
pub struct DiscoveryTracker {
    sent: HashSet<String>,
}

impl DiscoveryTracker {
    pub fn new() -> Self {
        return DiscoveryTracker { sent: HashSet::new() };
    }

    pub fn is_sent(&self, meter_id: &str) -> bool {
        return self.sent.contains(meter_id);
    }

    pub fn mark_sent(&mut self, meter_id: &str) {
        self.sent.insert(meter_id.to_string());
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    return match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    };
}

fn is_fatal_connection_error(err: &ConnectionError) -> bool {
    return matches!(err, ConnectionError::Tls(_));
}

pub struct MqttPublisher {
    client: AsyncClient,
    config: MqttConfig,
    state: watch::Receiver<ConnectionState>,
    eventloop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Sets up the client and starts the event loop. The connection itself is
    /// established in the background, publish calls wait for it.
    pub fn connect(config: &MqttConfig) -> Result<Self, PublishError> {
        let client_id = config.client_id.clone()
            .unwrap_or_else(|| format!("rtlamr2mqtt-{}", Uuid::new_v4().simple()));
        info!("MQTT connection to {}:{} starting up as {client_id}", config.host, config.port);

        let mut mqttoptions = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive.max(5)));
        if let Some(user) = &config.user {
            mqttoptions.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }
        mqttoptions.set_last_will(LastWill::new(config.availability_topic(), "offline", QoS::AtLeastOnce, true));
        mqttoptions.set_transport(tls::build_transport(config)?);

        let (client, eventloop) = AsyncClient::new(mqttoptions, REQUEST_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let handle = tokio::spawn(run_eventloop(eventloop, client.clone(), config.clone(), state_tx));

        return Ok(MqttPublisher {
            client,
            config: config.clone(),
            state: state_rx,
            eventloop: handle,
        });
    }

    pub fn state(&self) -> ConnectionState {
        return self.state.borrow().clone();
    }

    /// Waits up to `connect_timeout` for the broker
    pub async fn wait_connected(&mut self) -> Result<(), PublishError> {
        let deadline = Duration::from_secs(self.config.connect_timeout);
        let state = &mut self.state;
        let waited = tokio::time::timeout(deadline, async move {
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed(_)))
                .await
                .map(|s| s.clone())
        }).await;

        return match waited {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(ConnectionState::Failed(reason))) => Err(PublishError::Fatal(reason)),
            Ok(Ok(_)) => Err(PublishError::NotConnected),
            Ok(Err(_)) => Err(PublishError::Fatal("MQTT event loop stopped".to_string())),
            Err(_) => Err(PublishError::NotConnected),
        };
    }

    async fn publish(&mut self, topic: String, payload: String, retain: bool) -> Result<(), PublishError> {
        self.wait_connected().await?;

        let qos = qos_from_u8(self.config.qos);
        return match tokio::time::timeout(PUBLISH_TIMEOUT, self.client.publish(topic.clone(), qos, retain, payload.clone())).await {
            Ok(Ok(())) => {
                debug!("MQTT published: {topic} -> {payload}");
                Ok(())
            }
            Ok(Err(e)) => Err(PublishError::Client(e)),
            Err(_) => Err(PublishError::Timeout(topic)),
        };
    }

    /// Best effort `offline`, then a clean disconnect
    pub async fn disconnect(mut self) {
        if self.state() == ConnectionState::Connected {
            let offline = self.client.publish(self.config.availability_topic(), QoS::AtLeastOnce, true, "offline");
            if tokio::time::timeout(PUBLISH_TIMEOUT, offline).await.is_err() {
                warn!("Unable to publish offline state in time");
            }
        }

        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.client.disconnect()).await {
            Ok(Ok(())) => debug!("MQTT disconnect requested"),
            Ok(Err(e)) => warn!("MQTT disconnect failed: {e}"),
            Err(_) => warn!("MQTT disconnect timed out"),
        }

        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.eventloop).await.is_err() {
            warn!("MQTT event loop did not stop, aborting it");
            self.eventloop.abort();
        }
        info!("MQTT connection closed");
    }
}

impl ReadingPublisher for MqttPublisher {
    async fn publish_discovery(&mut self, meter: &MeterConfig) -> Result<(), PublishError> {
        let disc = HaSensorDiscover::new(meter, &self.config);
        let payload = serde_json::to_string(&disc)?;
        self.publish(disc.discover_topic.clone(), payload, true).await?;
        info!("Published discovery for meter {} on {}", meter.id, disc.discover_topic);
        return Ok(());
    }

    async fn publish_state(&mut self, reading: &PublishedReading) -> Result<(), PublishError> {
        let topic = self.config.state_topic(&reading.meter_id);
        let retain = self.config.state_retain;
        return self.publish(topic, reading.formatted_value.clone(), retain).await;
    }
}

/// Drives the connection. rumqttc reconnects on the next poll after an error,
/// so the loop only has to pace the attempts.
async fn run_eventloop(mut eventloop: EventLoop, client: AsyncClient, config: MqttConfig,
                       state: watch::Sender<ConnectionState>) {
    info!("MQTT Eventloop started");
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker {}:{}", config.host, config.port);
                backoff.reset();
                let _ = state.send(ConnectionState::Connected);
                if let Err(e) = client.try_publish(config.availability_topic(), QoS::AtLeastOnce, true, "online") {
                    warn!("Unable to publish online state: {e}");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, leaving event loop");
                let _ = state.send(ConnectionState::Disconnected);
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!("MQTT client dropped, leaving event loop");
                let _ = state.send(ConnectionState::Disconnected);
                break;
            }
            Err(e) if is_fatal_connection_error(&e) => {
                error!("MQTT connection to {}:{} failed permanently: {e}", config.host, config.port);
                let _ = state.send(ConnectionState::Failed(e.to_string()));
                break;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!("Error in MQTT {e}, reconnecting in {:.1}s", delay.as_secs_f64());
                let _ = state.send(ConnectionState::Disconnected);
                tokio::time::sleep(delay).await;
                let _ = state.send(ConnectionState::Connecting);
            }
        }
    }
}
