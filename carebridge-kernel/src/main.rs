/**
 * CAREBRIDGE KERNEL - Point d'entrée du service d'ingestion télémétrie
 *
 * RÔLE : Assemble config, store, pipeline, superviseur MQTT et API HTTP,
 * puis orchestre l'arrêt propre sur Ctrl-C.
 *
 * ORDRE D'ARRÊT : serveur HTTP → pipeline (jeton + attente des tâches)
 * → superviseur MQTT (DISCONNECT, délai de grâce, annulation).
 */

mod alerts;
mod broadcast;
mod config;
mod dispatch;
mod health;
mod http;
mod identity;
mod keyed_lock;
mod models;
mod mqtt;
mod normalize;
mod persistence;
mod pipeline;
mod republish;
mod store;

use crate::broadcast::BroadcastRegistry;
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::mqtt::ConnectionSupervisor;
use crate::pipeline::Pipeline;
use crate::store::open_store;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    let store = open_store(&cfg.store).context("opening store")?;
    info!("[kernel] store ready ({:?})", cfg.store);

    let supervisor = ConnectionSupervisor::new(&cfg.mqtt, cfg.topics.patterns()).context("configuring MQTT links")?;
    let registry = Arc::new(BroadcastRegistry::new());
    let pipeline = Arc::new(Pipeline::new(
        &cfg,
        store.clone(),
        Arc::new(supervisor.publisher()),
        registry.clone(),
    ));

    match pipeline.resolver().warm().await {
        Ok(count) => info!("[kernel] {} known identities", count),
        Err(e) => warn!("[kernel] cannot preload identities: {}", e),
    }

    supervisor.start(pipeline.clone());
    pipeline.start_heartbeat(cfg.heartbeat_interval(), supervisor.publisher_state());

    let app_state = AppState {
        store,
        resolver: pipeline.resolver(),
        stats: pipeline.stats(),
        registry,
        health_tracker: HealthTracker::new(supervisor.subscriber_state(), supervisor.publisher_state()),
        api_key: std::env::var("CAREBRIDGE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(Arc::from),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!("[kernel] listening on http://{}", cfg.http.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("[kernel] cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("[kernel] shutdown requested");
        })
        .await
        .context("HTTP server")?;

    pipeline.stop().await;
    supervisor.stop().await;
    info!("[kernel] bye");
    Ok(())
}
