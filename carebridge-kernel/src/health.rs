/**
 * HEALTH - État du service et heartbeat applicatif
 *
 * - `HealthTracker` : uptime, phases des deux liens MQTT, compteurs du
 *   pipeline, mémoire ; exposé par GET /system/health
 * - `Heartbeat` : attend le premier `connected` du lien publisher puis publie
 *   périodiquement un instantané des patients suivis, trafic ou pas
 */

use crate::broadcast::{BroadcastRegistry, Channel};
use crate::identity::IdentityResolver;
use crate::models::now_epoch;
use crate::mqtt::ConnectionState;
use crate::pipeline::{PipelineStats, StatsSnapshot};
use crate::republish::{HealthStatus, Republisher};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub identities_tracked: usize,
    /// Identités créées à la volée depuis le démarrage
    pub identities_provisioned: u64,
    pub memory_usage_mb: f32,
    pub subscriber: ConnectionState,
    pub publisher: ConnectionState,
    pub pipeline: StatsSnapshot,
    pub live_sessions: LiveSessions,
}

#[derive(Debug, Serialize)]
pub struct LiveSessions {
    pub health: usize,
    pub location: usize,
    pub alerts: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    subscriber: watch::Receiver<ConnectionState>,
    publisher: watch::Receiver<ConnectionState>,
}

impl HealthTracker {
    pub fn new(
        subscriber: watch::Receiver<ConnectionState>,
        publisher: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            subscriber,
            publisher,
        }
    }

    pub fn get_health(
        &self,
        resolver: &IdentityResolver,
        stats: &PipelineStats,
        registry: &BroadcastRegistry,
    ) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            identities_tracked: resolver.identity_count(),
            identities_provisioned: resolver.provisioned(),
            memory_usage_mb: get_memory_usage_mb(),
            subscriber: self.subscriber.borrow().clone(),
            publisher: self.publisher.borrow().clone(),
            pipeline: stats.snapshot(),
            live_sessions: LiveSessions {
                health: registry.session_count(Channel::Health),
                location: registry.session_count(Channel::Location),
                alerts: registry.session_count(Channel::Alerts),
            },
        }
    }
}

/// Tâche heartbeat, lancée par le pipeline sur son TaskTracker
pub struct Heartbeat {
    pub interval: Duration,
    pub publisher_state: watch::Receiver<ConnectionState>,
    pub resolver: Arc<IdentityResolver>,
    pub stats: Arc<PipelineStats>,
    pub republisher: Arc<Republisher>,
    pub registry: Arc<BroadcastRegistry>,
}

impl Heartbeat {
    pub fn status(&self) -> HealthStatus {
        let counters = self.stats.snapshot();
        HealthStatus {
            identity_count: self.resolver.identity_count(),
            patients: self.resolver.snapshot(),
            processed: counters.processed,
            rejected: counters.rejected,
            timestamp: now_epoch(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let state = &mut self.publisher_state;
        let connected = tokio::select! {
            _ = shutdown.cancelled() => false,
            ready = async { state.wait_for(|s| s.is_connected()).await.map(|_| ()) } => ready.is_ok(),
        };
        if !connected {
            return;
        }
        info!("[heartbeat] publisher connected, every {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let status = self.status();
                    if self.republisher.publish_health_status(&status).await {
                        debug!("[heartbeat] published ({} identities)", status.identity_count);
                    }
                    self.registry.broadcast(Channel::Health, "health_status", &status);
                }
            }
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
