/**
 * CONNECTION SUPERVISOR - Deux liens MQTT supervisés
 *
 * RÔLE :
 * - lien "subscriber" : reçoit la télémétrie terrain et la confie au handler
 * - lien "publisher" : republication aval et heartbeat
 *
 * MACHINE D'ÉTAT (par lien) :
 *   disconnected → connecting → connected
 *   erreur transport → reconnecting → (délai) → connecting, sans limite
 *
 * Tant qu'un lien n'est pas `connected`, aucun message n'est transmis ni
 * mis en tampon. Les abonnements sont refaits à chaque ConnAck.
 *
 * La boucle est écrite contre `LinkDriver` pour être pilotable en test.
 */

use crate::config::{BrokerConf, MqttSettings};
use crate::models::RawMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cannot read CA file {path}: {source}")]
    CaFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

impl From<rumqttc::ConnectionError> for ConnectionError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        ConnectionError::Transport(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher link not connected")]
    NotConnected,
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Subscriber,
    Publisher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Subscriber => f.write_str("subscriber"),
            Role::Publisher => f.write_str("publisher"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub role: Role,
    pub phase: Phase,
    pub last_error: Option<String>,
    pub reconnects: u32,
}

impl ConnectionState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: Phase::Disconnected,
            last_error: None,
            reconnects: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }
}

/// Événement de lien, réduit à ce que la machine d'état exploite
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    ConnAck,
    Publish { topic: String, payload: Vec<u8> },
    /// DISCONNECT émis par ce processus
    Closed,
    Other,
}

#[async_trait]
pub trait LinkDriver: Send {
    async fn next_event(&mut self) -> Result<LinkEvent, ConnectionError>;

    /// Appelé à chaque ConnAck avec les filtres du lien
    fn subscribe(&mut self, filters: &[String]) -> Result<(), ConnectionError>;
}

/// Lien rumqttc réel : client + event loop
pub struct RumqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl LinkDriver for RumqttLink {
    async fn next_event(&mut self) -> Result<LinkEvent, ConnectionError> {
        match self.eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(_)) => Ok(LinkEvent::ConnAck),
            Event::Incoming(Packet::Publish(p)) => Ok(LinkEvent::Publish {
                topic: p.topic,
                payload: p.payload.to_vec(),
            }),
            Event::Incoming(Packet::Disconnect) => {
                Err(ConnectionError::Transport("broker sent DISCONNECT".into()))
            }
            Event::Outgoing(Outgoing::Disconnect) => Ok(LinkEvent::Closed),
            _ => Ok(LinkEvent::Other),
        }
    }

    fn subscribe(&mut self, filters: &[String]) -> Result<(), ConnectionError> {
        for filter in filters {
            self.client
                .try_subscribe(filter.as_str(), QoS::AtLeastOnce)
                .map_err(|e| ConnectionError::Subscribe(format!("{filter}: {e}")))?;
        }
        Ok(())
    }
}

/// Reçoit les messages du lien subscriber ; ne doit pas bloquer
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: RawMessage);
}

/// Boucle d'un lien : pilote la machine d'état jusqu'à l'annulation
pub struct LinkTask<D> {
    pub driver: D,
    pub role: Role,
    pub filters: Vec<String>,
    pub handler: Option<Arc<dyn MessageHandler>>,
    pub state: watch::Sender<ConnectionState>,
    pub reconnect_delay: Duration,
}

impl<D: LinkDriver> LinkTask<D> {
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.set_phase(Phase::Connecting);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.driver.next_event() => event,
            };

            match event {
                Ok(LinkEvent::ConnAck) => {
                    if !self.filters.is_empty() {
                        match self.driver.subscribe(&self.filters) {
                            Ok(()) => info!("[mqtt] {} subscribed to {} filters", self.role, self.filters.len()),
                            Err(e) => warn!("[mqtt] {} {}", self.role, e),
                        }
                    }
                    self.state.send_modify(|s| {
                        s.phase = Phase::Connected;
                        s.last_error = None;
                    });
                    info!("[mqtt] {} link connected", self.role);
                }
                Ok(LinkEvent::Publish { topic, payload }) => {
                    if !self.state.borrow().is_connected() {
                        debug!("[mqtt] {} dropped message on {} while not connected", self.role, topic);
                        continue;
                    }
                    if let Some(handler) = &self.handler {
                        handler.on_message(RawMessage::new(topic, payload));
                    }
                }
                Ok(LinkEvent::Closed) => {
                    info!("[mqtt] {} link closed", self.role);
                    break;
                }
                Ok(LinkEvent::Other) => {}
                Err(e) => {
                    warn!("[mqtt] {} link error: {}", self.role, e);
                    self.state.send_modify(|s| {
                        s.phase = Phase::Reconnecting;
                        s.last_error = Some(e.to_string());
                        s.reconnects += 1;
                    });
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                    self.set_phase(Phase::Connecting);
                }
            }
        }

        self.set_phase(Phase::Disconnected);
    }

    fn set_phase(&self, phase: Phase) {
        self.state.send_modify(|s| s.phase = phase);
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;
}

/// Handle de publication clonable sur le lien publisher
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        if !self.state.borrow().is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }
}

struct PendingLinks {
    subscriber: (EventLoop, watch::Sender<ConnectionState>),
    publisher: (EventLoop, watch::Sender<ConnectionState>),
}

pub struct ConnectionSupervisor {
    reconnect_delay: Duration,
    shutdown_grace: Duration,
    filters: Vec<String>,
    subscriber_client: AsyncClient,
    publisher_client: AsyncClient,
    subscriber_state: watch::Receiver<ConnectionState>,
    publisher_state: watch::Receiver<ConnectionState>,
    pending: Mutex<Option<PendingLinks>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ConnectionSupervisor {
    pub fn new(settings: &MqttSettings, filters: Vec<String>) -> Result<Self, ConnectionError> {
        let (subscriber_client, subscriber_loop) = AsyncClient::new(mqtt_options(&settings.subscriber)?, 64);
        let (publisher_client, publisher_loop) = AsyncClient::new(mqtt_options(&settings.publisher)?, 256);
        let (sub_tx, subscriber_state) = watch::channel(ConnectionState::new(Role::Subscriber));
        let (pub_tx, publisher_state) = watch::channel(ConnectionState::new(Role::Publisher));

        Ok(Self {
            reconnect_delay: settings.reconnect_delay(),
            shutdown_grace: settings.shutdown_grace(),
            filters,
            subscriber_client,
            publisher_client,
            subscriber_state,
            publisher_state,
            pending: Mutex::new(Some(PendingLinks {
                subscriber: (subscriber_loop, sub_tx),
                publisher: (publisher_loop, pub_tx),
            })),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.publisher_client.clone(),
            state: self.publisher_state.clone(),
        }
    }

    pub fn subscriber_state(&self) -> watch::Receiver<ConnectionState> {
        self.subscriber_state.clone()
    }

    pub fn publisher_state(&self) -> watch::Receiver<ConnectionState> {
        self.publisher_state.clone()
    }

    /// Lance les deux boucles ; un second appel est ignoré
    pub fn start(&self, handler: Arc<dyn MessageHandler>) {
        let Some(links) = self.pending.lock().take() else {
            warn!("[mqtt] supervisor already started");
            return;
        };

        let (subscriber_loop, sub_tx) = links.subscriber;
        let subscriber = LinkTask {
            driver: RumqttLink {
                client: self.subscriber_client.clone(),
                eventloop: subscriber_loop,
            },
            role: Role::Subscriber,
            filters: self.filters.clone(),
            handler: Some(handler),
            state: sub_tx,
            reconnect_delay: self.reconnect_delay,
        };

        let (publisher_loop, pub_tx) = links.publisher;
        let publisher = LinkTask {
            driver: RumqttLink {
                client: self.publisher_client.clone(),
                eventloop: publisher_loop,
            },
            role: Role::Publisher,
            filters: Vec::new(),
            handler: None,
            state: pub_tx,
            reconnect_delay: self.reconnect_delay,
        };

        self.tasks.spawn(subscriber.run(self.shutdown.clone()));
        self.tasks.spawn(publisher.run(self.shutdown.clone()));
        self.tasks.close();
        info!("[mqtt] supervisor started ({} inbound filters)", self.filters.len());
    }

    /// DISCONNECT propre, délai de grâce, puis annulation des boucles
    pub async fn stop(&self) {
        for (role, client) in [
            (Role::Subscriber, &self.subscriber_client),
            (Role::Publisher, &self.publisher_client),
        ] {
            if let Err(e) = client.try_disconnect() {
                debug!("[mqtt] {} disconnect request failed: {}", role, e);
            }
        }

        self.tasks.close();
        if tokio::time::timeout(self.shutdown_grace, self.tasks.wait()).await.is_err() {
            warn!("[mqtt] links still open after {:?}, cancelling", self.shutdown_grace);
        }
        self.shutdown.cancel();
        self.tasks.wait().await;
        info!("[mqtt] supervisor stopped");
    }
}

fn mqtt_options(conf: &BrokerConf) -> Result<MqttOptions, ConnectionError> {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs.max(5)));

    if let Some(username) = &conf.username {
        opts.set_credentials(username, conf.password.as_deref().unwrap_or_default());
    }

    if conf.tls {
        let transport = match &conf.ca_path {
            Some(path) => {
                let ca = std::fs::read(path).map_err(|source| ConnectionError::CaFile {
                    path: path.clone(),
                    source,
                })?;
                Transport::tls(ca, None, None)
            }
            None => Transport::tls_with_default_config(),
        };
        opts.set_transport(transport);
    }

    Ok(opts)
}

#[cfg(test)]
mod mock_publisher {
    use super::{PublishError, Publisher};
    use async_trait::async_trait;
    use carebridge_devkit::MockMqttClient;
    use rumqttc::QoS;

    #[async_trait]
    impl Publisher for MockMqttClient {
        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
            MockMqttClient::publish(self, topic, qos, false, payload)
                .await
                .map_err(|e| PublishError::Rejected(e.to_string()))
        }
    }
}
