/**
 * STORE - Contrat de persistance du pipeline
 *
 * RÔLE :
 * Le pipeline n'a besoin que d'insertions et de lectures ponctuelles par
 * identifiant externe. Ce trait fixe ce contrat ; le schéma relationnel
 * complet appartient à la surface CRUD.
 *
 * GARANTIES EXIGÉES DES IMPLÉMENTATIONS :
 * - `create_identity` est un upsert : unicité sur `external_id`, l'existant
 *   est renvoyé en cas de conflit (le premier nom affiché gagne)
 * - `insert_alert` refuse une seconde alerte `active` pour le même couple
 *   (patient, type) avec `PersistenceError::Conflict`
 *
 * IMPLÉMENTATIONS :
 * - `MemoryStore` : défaut, tests
 * - `SqliteStore` : rusqlite, index uniques
 */

pub mod memory;
pub mod sqlite;

use crate::config::StoreConf;
use crate::models::{AlertEvent, AlertStatus, Identity, PositionRecord, VitalRecord};
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Conflict(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Vital stocké, relu par l'API de consultation
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredVital {
    pub internal_patient_id: String,
    pub record: VitalRecord,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredPosition {
    pub internal_patient_id: String,
    pub record: PositionRecord,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_identity_by_external_id(&self, external_id: &str) -> Result<Option<Identity>, PersistenceError>;

    /// Upsert : renvoie l'identité existante si `external_id` est déjà pris
    async fn create_identity(&self, external_id: &str, display_name: &str) -> Result<Identity, PersistenceError>;

    async fn list_identities(&self) -> Result<Vec<Identity>, PersistenceError>;

    async fn insert_vital_record(&self, internal_id: &str, record: &VitalRecord) -> Result<(), PersistenceError>;

    async fn insert_position_record(&self, internal_id: &str, record: &PositionRecord) -> Result<(), PersistenceError>;

    async fn find_active_alert(&self, internal_id: &str, alert_type: &str) -> Result<Option<AlertEvent>, PersistenceError>;

    async fn insert_alert(&self, alert: &AlertEvent) -> Result<(), PersistenceError>;

    async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<AlertEvent>, PersistenceError>;

    /// Plus récents d'abord
    async fn recent_vitals(&self, internal_id: &str, limit: usize) -> Result<Vec<StoredVital>, PersistenceError>;

    async fn recent_positions(&self, internal_id: &str, limit: usize) -> Result<Vec<StoredPosition>, PersistenceError>;
}

pub type SharedStore = Arc<dyn Store>;

pub fn open_store(conf: &StoreConf) -> Result<SharedStore, PersistenceError> {
    match conf {
        StoreConf::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConf::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path)?)),
    }
}

pub(crate) fn placeholder_identity(external_id: &str, display_name: &str) -> Identity {
    Identity {
        internal_id: uuid::Uuid::new_v4().to_string(),
        external_id: external_id.to_string(),
        display_name: display_name.to_string(),
        created_at: crate::models::now_epoch(),
    }
}
