use super::{placeholder_identity, PersistenceError, Store, StoredPosition, StoredVital};
use crate::models::{AlertEvent, AlertStatus, Identity, PositionRecord, VitalRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Historique conservé par patient et par table ; les plus anciens sortent
pub const HISTORY_PER_PATIENT: usize = 500;

#[derive(Default)]
struct Tables {
    /// external_id -> identité
    identities: HashMap<String, Identity>,
    /// internal_id -> derniers enregistrements, plus ancien en tête
    vitals: HashMap<String, VecDeque<VitalRecord>>,
    positions: HashMap<String, VecDeque<PositionRecord>>,
    alerts: Vec<AlertEvent>,
}

/// Store en mémoire ; les contraintes d'unicité sont vérifiées sous le verrou
pub struct MemoryStore {
    tables: Mutex<Tables>,
    history: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_history(HISTORY_PER_PATIENT)
    }
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    if queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(item);
}

fn newest<T: Clone, R>(
    queue: Option<&VecDeque<T>>,
    limit: usize,
    wrap: impl Fn(T) -> R,
) -> Vec<R> {
    queue
        .map(|q| q.iter().rev().take(limit).cloned().map(wrap).collect())
        .unwrap_or_default()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            history: history.max(1),
        }
    }

    #[cfg(test)]
    pub fn vital_count(&self) -> usize {
        self.tables.lock().vitals.values().map(VecDeque::len).sum()
    }

    #[cfg(test)]
    pub fn position_count(&self) -> usize {
        self.tables.lock().positions.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_identity_by_external_id(&self, external_id: &str) -> Result<Option<Identity>, PersistenceError> {
        Ok(self.tables.lock().identities.get(external_id).cloned())
    }

    async fn create_identity(&self, external_id: &str, display_name: &str) -> Result<Identity, PersistenceError> {
        let mut tables = self.tables.lock();
        let identity = tables
            .identities
            .entry(external_id.to_string())
            .or_insert_with(|| placeholder_identity(external_id, display_name));
        Ok(identity.clone())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, PersistenceError> {
        let mut list: Vec<Identity> = self.tables.lock().identities.values().cloned().collect();
        list.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(list)
    }

    async fn insert_vital_record(&self, internal_id: &str, record: &VitalRecord) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock();
        let queue = tables.vitals.entry(internal_id.to_string()).or_default();
        push_capped(queue, record.clone(), self.history);
        Ok(())
    }

    async fn insert_position_record(&self, internal_id: &str, record: &PositionRecord) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock();
        let queue = tables.positions.entry(internal_id.to_string()).or_default();
        push_capped(queue, record.clone(), self.history);
        Ok(())
    }

    async fn find_active_alert(&self, internal_id: &str, alert_type: &str) -> Result<Option<AlertEvent>, PersistenceError> {
        Ok(self
            .tables
            .lock()
            .alerts
            .iter()
            .find(|a| {
                a.internal_patient_id == internal_id
                    && a.alert_type == alert_type
                    && a.status == AlertStatus::Active
            })
            .cloned())
    }

    async fn insert_alert(&self, alert: &AlertEvent) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock();
        let duplicate = alert.status == AlertStatus::Active
            && tables.alerts.iter().any(|a| {
                a.internal_patient_id == alert.internal_patient_id
                    && a.alert_type == alert.alert_type
                    && a.status == AlertStatus::Active
            });
        if duplicate {
            return Err(PersistenceError::Conflict(format!(
                "active {} alert already open for {}",
                alert.alert_type, alert.internal_patient_id
            )));
        }
        tables.alerts.push(alert.clone());
        Ok(())
    }

    async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<AlertEvent>, PersistenceError> {
        let tables = self.tables.lock();
        let mut list: Vec<AlertEvent> = tables
            .alerts
            .iter()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        Ok(list)
    }

    async fn recent_vitals(&self, internal_id: &str, limit: usize) -> Result<Vec<StoredVital>, PersistenceError> {
        let tables = self.tables.lock();
        Ok(newest(tables.vitals.get(internal_id), limit, |record| StoredVital {
            internal_patient_id: internal_id.to_string(),
            record,
        }))
    }

    async fn recent_positions(&self, internal_id: &str, limit: usize) -> Result<Vec<StoredPosition>, PersistenceError> {
        let tables = self.tables.lock();
        Ok(newest(tables.positions.get(internal_id), limit, |record| StoredPosition {
            internal_patient_id: internal_id.to_string(),
            record,
        }))
    }
}
