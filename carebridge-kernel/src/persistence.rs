use crate::models::{PositionRecord, VitalRecord};
use crate::store::SharedStore;
use tracing::warn;

/// Écriture des enregistrements canoniques ; une erreur de store est
/// journalisée et n'interrompt jamais le traitement du message.
#[derive(Clone)]
pub struct PersistenceWriter {
    store: SharedStore,
}

impl PersistenceWriter {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn append_position(&self, internal_id: &str, record: &PositionRecord) -> bool {
        match self.store.insert_position_record(internal_id, record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[persist] position for {} not stored: {}", record.external_device_id, e);
                false
            }
        }
    }

    pub async fn append_vital(&self, internal_id: &str, record: &VitalRecord) -> bool {
        match self.store.insert_vital_record(internal_id, record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "[persist] {} for {} not stored: {}",
                    record.reading.kind().as_str(),
                    record.external_patient_id,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertEvent, AlertStatus, Identity, Quality, VitalReading};
    use crate::store::{MemoryStore, PersistenceError, Store, StoredPosition, StoredVital};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Store dont toutes les écritures échouent
    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn find_identity_by_external_id(&self, _: &str) -> Result<Option<Identity>, PersistenceError> {
            Ok(None)
        }
        async fn create_identity(&self, _: &str, _: &str) -> Result<Identity, PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }
        async fn list_identities(&self) -> Result<Vec<Identity>, PersistenceError> {
            Ok(Vec::new())
        }
        async fn insert_vital_record(&self, _: &str, _: &VitalRecord) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }
        async fn insert_position_record(&self, _: &str, _: &PositionRecord) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }
        async fn find_active_alert(&self, _: &str, _: &str) -> Result<Option<AlertEvent>, PersistenceError> {
            Ok(None)
        }
        async fn insert_alert(&self, _: &AlertEvent) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("down".into()))
        }
        async fn list_alerts(&self, _: Option<AlertStatus>) -> Result<Vec<AlertEvent>, PersistenceError> {
            Ok(Vec::new())
        }
        async fn recent_vitals(&self, _: &str, _: usize) -> Result<Vec<StoredVital>, PersistenceError> {
            Ok(Vec::new())
        }
        async fn recent_positions(&self, _: &str, _: usize) -> Result<Vec<StoredPosition>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    fn heart_rate() -> VitalRecord {
        VitalRecord {
            external_patient_id: "p1".into(),
            reading: VitalReading::HeartRate { bpm: 72 },
            quality: Quality::Good,
            device_id: None,
            timestamp: 10,
        }
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let writer = PersistenceWriter::new(Arc::new(BrokenStore));
        assert!(!writer.append_vital("id-1", &heart_rate()).await);
    }

    #[tokio::test]
    async fn appends_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone());
        assert!(writer.append_vital("id-1", &heart_rate()).await);
        let pos = PositionRecord {
            external_device_id: "device_001".into(),
            tag_id: 1770,
            x: 1.0,
            y: 2.0,
            z: 0.0,
            accuracy: 95.0,
            area: None,
            timestamp: 10,
        };
        assert!(writer.append_position("id-1", &pos).await);
        assert_eq!(store.vital_count(), 1);
        assert_eq!(store.position_count(), 1);
    }
}
