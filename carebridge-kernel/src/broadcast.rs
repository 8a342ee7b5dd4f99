/**
 * LIVE BROADCAST REGISTRY - Diffusion temps réel vers les clients WebSocket
 *
 * RÔLE : Tient les sessions ouvertes par canal (health, location, alerts) et
 * leur pousse chaque mise à jour sous forme d'enveloppe JSON
 * `{"type", "data", "timestamp"}`.
 *
 * LIVRAISON :
 * - `try_send` non bloquant dans une file bornée par session
 * - file pleine ou fermée = échec : la session est retirée du registre
 * - un client lent ne ralentit jamais le pipeline
 */

use crate::models::now_epoch;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Taille de la file d'attente par session
pub const SESSION_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Health,
    Location,
    Alerts,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Health => "health",
            Channel::Location => "location",
            Channel::Alerts => "alerts",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DeliveryError {
    #[error("session queue full")]
    Full,
    #[error("session closed")]
    Closed,
}

pub trait SessionSink: Send + Sync {
    fn deliver(&self, frame: &str) -> Result<(), DeliveryError>;
}

impl SessionSink for mpsc::Sender<String> {
    fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        self.try_send(frame.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Welcome<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel: Channel,
    session_id: &'a str,
    timestamp: i64,
}

pub fn welcome_frame(channel: Channel, session_id: &str) -> String {
    let welcome = Welcome {
        kind: "welcome",
        channel,
        session_id,
        timestamp: now_epoch(),
    };
    serde_json::to_string(&welcome).unwrap_or_default()
}

type Sessions = HashMap<String, Box<dyn SessionSink>>;

#[derive(Default)]
pub struct BroadcastRegistry {
    channels: RwLock<HashMap<Channel, Sessions>>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Channel, sink: Box<dyn SessionSink>) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.channels
            .write()
            .entry(channel)
            .or_default()
            .insert(session_id.clone(), sink);
        info!("[broadcast] session {} joined {}", session_id, channel.as_str());
        session_id
    }

    pub fn unregister(&self, channel: Channel, session_id: &str) -> bool {
        let removed = self
            .channels
            .write()
            .get_mut(&channel)
            .and_then(|sessions| sessions.remove(session_id))
            .is_some();
        if removed {
            info!("[broadcast] session {} left {}", session_id, channel.as_str());
        }
        removed
    }

    pub fn session_count(&self, channel: Channel) -> usize {
        self.channels.read().get(&channel).map_or(0, HashMap::len)
    }

    /// Enveloppe `data` et la pousse à toutes les sessions du canal.
    /// Renvoie le nombre de sessions effectivement livrées.
    pub fn broadcast<T: Serialize>(&self, channel: Channel, kind: &str, data: &T) -> usize {
        let envelope = Envelope {
            kind,
            data,
            timestamp: now_epoch(),
        };
        match serde_json::to_string(&envelope) {
            Ok(frame) => self.broadcast_frame(channel, &frame),
            Err(e) => {
                debug!("[broadcast] cannot encode {} frame: {}", kind, e);
                0
            }
        }
    }

    pub fn broadcast_frame(&self, channel: Channel, frame: &str) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let channels = self.channels.read();
            let Some(sessions) = channels.get(&channel) else {
                return 0;
            };
            for (session_id, sink) in sessions {
                match sink.deliver(frame) {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((session_id.clone(), e)),
                }
            }
        }

        if !failed.is_empty() {
            let mut channels = self.channels.write();
            if let Some(sessions) = channels.get_mut(&channel) {
                for (session_id, e) in failed {
                    sessions.remove(&session_id);
                    info!("[broadcast] pruned session {} from {}: {}", session_id, channel.as_str(), e);
                }
            }
        }
        delivered
    }
}

/// Vie d'une session WebSocket : enregistrement, message d'accueil, relais
/// de la file vers le socket, désenregistrement à la fermeture.
pub async fn serve_session(socket: WebSocket, channel: Channel, registry: Arc<BroadcastRegistry>) {
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE);
    let session_id = registry.register(channel, Box::new(tx));
    let (mut sink, mut stream) = socket.split();

    let welcome = welcome_frame(channel, &session_id);
    if sink.send(Message::Text(welcome.into())).await.is_ok() {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // retirée du registre
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    registry.unregister(channel, &session_id);
}
