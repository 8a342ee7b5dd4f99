/**
 * PIPELINE - Traitement de bout en bout d'un message terrain
 *
 * FLUX (une tâche par message, sur le TaskTracker du pipeline) :
 *   dispatch → normalisation → identité → (persistance ‖ alertes)
 *            → republication → diffusion live
 *
 * ISOLATION : une erreur de décodage, de store ou de publication termine le
 * traitement de CE message et rien d'autre ; les compteurs en gardent trace.
 *
 * ARRÊT : `stop()` annule le jeton, ferme et attend le tracker. Le
 * superviseur MQTT n'est arrêté qu'ensuite.
 */

use crate::alerts::{self, AlertCandidate, AlertService};
use crate::broadcast::{BroadcastRegistry, Channel};
use crate::config::KernelConfig;
use crate::dispatch::TopicDispatcher;
use crate::health::Heartbeat;
use crate::identity::IdentityResolver;
use crate::models::{CanonicalRecord, DeviceAlert, Identity, PositionRecord, RawMessage, VitalRecord};
use crate::mqtt::{ConnectionState, MessageHandler, Publisher};
use crate::normalize::{self, TagTable};
use crate::persistence::PersistenceWriter;
use crate::republish::{AlertNotice, LocationUpdate, Republisher, VitalUpdate};
use crate::store::SharedStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    processed: AtomicU64,
    rejected: AtomicU64,
    unrouted: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    persist_failures: AtomicU64,
    publish_failures: AtomicU64,
    alerts_raised: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub rejected: u64,
    pub unrouted: u64,
    pub ignored: u64,
    pub failed: u64,
    pub persist_failures: u64,
    pub publish_failures: u64,
    pub alerts_raised: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: get(&self.received),
            processed: get(&self.processed),
            rejected: get(&self.rejected),
            unrouted: get(&self.unrouted),
            ignored: get(&self.ignored),
            failed: get(&self.failed),
            persist_failures: get(&self.persist_failures),
            publish_failures: get(&self.publish_failures),
            alerts_raised: get(&self.alerts_raised),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Issue du traitement d'un message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// Aucun filtre ne correspond au topic
    Unrouted,
    /// Reconnu mais sans enregistrement (discriminant inconnu)
    Ignored,
    /// Payload invalide
    Rejected,
    /// Identité introuvable et non créable (store indisponible)
    Failed,
}

struct PipelineCore {
    dispatcher: TopicDispatcher,
    tags: TagTable,
    resolver: Arc<IdentityResolver>,
    writer: PersistenceWriter,
    alerts: AlertService,
    republisher: Arc<Republisher>,
    registry: Arc<BroadcastRegistry>,
    stats: Arc<PipelineStats>,
}

pub struct Pipeline {
    core: Arc<PipelineCore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: &KernelConfig,
        store: SharedStore,
        publisher: Arc<dyn Publisher>,
        registry: Arc<BroadcastRegistry>,
    ) -> Self {
        let core = PipelineCore {
            dispatcher: TopicDispatcher::new(&config.topics),
            tags: TagTable::new(config.tags.clone()),
            resolver: Arc::new(IdentityResolver::new(store.clone())),
            writer: PersistenceWriter::new(store.clone()),
            alerts: AlertService::new(store),
            republisher: Arc::new(Republisher::new(publisher, config.outbound.clone())),
            registry,
            stats: Arc::new(PipelineStats::default()),
        };
        Self {
            core: Arc::new(core),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn resolver(&self) -> Arc<IdentityResolver> {
        self.core.resolver.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.core.stats.clone()
    }

    pub fn start_heartbeat(&self, interval: Duration, publisher_state: watch::Receiver<ConnectionState>) {
        let heartbeat = Heartbeat {
            interval,
            publisher_state,
            resolver: self.core.resolver.clone(),
            stats: self.core.stats.clone(),
            republisher: self.core.republisher.clone(),
            registry: self.core.registry.clone(),
        };
        self.tasks.spawn(heartbeat.run(self.shutdown.clone()));
    }

    /// Traite un message jusqu'au bout, dans la tâche appelante
    #[cfg(test)]
    pub async fn process(&self, message: RawMessage) -> Outcome {
        self.core.process(message).await
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("[pipeline] stopped, {:?}", self.core.stats.snapshot());
    }
}

impl MessageHandler for Pipeline {
    fn on_message(&self, message: RawMessage) {
        if self.shutdown.is_cancelled() {
            debug!("[pipeline] stopping, dropped message on {}", message.topic);
            return;
        }
        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = core.process(message) => {}
            }
        });
    }
}

impl PipelineCore {
    async fn process(&self, message: RawMessage) -> Outcome {
        bump(&self.stats.received);

        let Some(route) = self.dispatcher.route(&message.topic) else {
            debug!("[pipeline] no route for {}", message.topic);
            bump(&self.stats.unrouted);
            return Outcome::Unrouted;
        };

        let record = match normalize::normalize(&route, &message, &self.tags) {
            Ok(Some(record)) => record,
            Ok(None) => {
                bump(&self.stats.ignored);
                return Outcome::Ignored;
            }
            Err(e) => {
                warn!("[pipeline] rejected payload on {}: {}", message.topic, e);
                bump(&self.stats.rejected);
                return Outcome::Rejected;
            }
        };

        let outcome = match record {
            CanonicalRecord::Position(position) => self.handle_position(position).await,
            CanonicalRecord::Vital(vital) => self.handle_vital(vital).await,
            CanonicalRecord::Alert(alert) => self.handle_device_alert(alert).await,
        };
        if outcome == Outcome::Processed {
            bump(&self.stats.processed);
        }
        outcome
    }

    async fn resolve(&self, external_id: &str, timestamp: i64, hint: Option<&str>) -> Option<Identity> {
        match self.resolver.resolve_or_create(external_id, hint).await {
            Ok(identity) => {
                self.resolver.touch(external_id, timestamp);
                Some(identity)
            }
            Err(e) => {
                warn!("[pipeline] cannot resolve identity {}: {}", external_id, e);
                bump(&self.stats.failed);
                None
            }
        }
    }

    async fn handle_position(&self, position: PositionRecord) -> Outcome {
        let hint = format!("Tag {}", position.tag_hex());
        let Some(identity) = self
            .resolve(&position.external_device_id, position.timestamp, Some(&hint))
            .await
        else {
            return Outcome::Failed;
        };

        if !self.writer.append_position(&identity.internal_id, &position).await {
            bump(&self.stats.persist_failures);
        }

        let update = LocationUpdate::from(&position);
        self.published(self.republisher.republish_position(&update).await);
        self.registry.broadcast(Channel::Location, "location", &update);
        Outcome::Processed
    }

    async fn handle_vital(&self, vital: VitalRecord) -> Outcome {
        let Some(identity) = self.resolve(&vital.external_patient_id, vital.timestamp, None).await else {
            return Outcome::Failed;
        };

        let (stored, opened) = tokio::join!(
            self.writer.append_vital(&identity.internal_id, &vital),
            self.raise(&identity, alerts::evaluate(&vital)),
        );
        if !stored {
            bump(&self.stats.persist_failures);
        }

        let update = VitalUpdate::from(&vital);
        self.published(self.republisher.republish_vital(&update).await);
        self.registry.broadcast(Channel::Health, update.kind(), &update);

        if let Some(notice) = opened {
            self.announce(&notice).await;
        }
        Outcome::Processed
    }

    async fn handle_device_alert(&self, alert: DeviceAlert) -> Outcome {
        let Some(identity) = self.resolve(&alert.external_patient_id, alert.timestamp, None).await else {
            return Outcome::Failed;
        };
        if let Some(notice) = self.raise(&identity, Some(AlertCandidate::from(alert))).await {
            self.announce(&notice).await;
        }
        Outcome::Processed
    }

    /// Ouvre l'alerte ; `Some` seulement si elle vient d'être créée
    async fn raise(&self, identity: &Identity, candidate: Option<AlertCandidate>) -> Option<AlertNotice> {
        let candidate = candidate?;
        match self.alerts.raise(identity, candidate).await {
            Ok(Some(event)) => {
                bump(&self.stats.alerts_raised);
                Some(AlertNotice::new(&identity.external_id, &event))
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[pipeline] alert for {} not recorded: {}", identity.external_id, e);
                bump(&self.stats.persist_failures);
                None
            }
        }
    }

    async fn announce(&self, notice: &AlertNotice) {
        self.published(self.republisher.republish_alert(notice).await);
        self.registry.broadcast(Channel::Alerts, "alert", notice);
    }

    fn published(&self, ok: bool) {
        if !ok {
            bump(&self.stats.publish_failures);
        }
    }
}
