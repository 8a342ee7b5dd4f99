/**
 * ALERT EVALUATOR - Seuils cliniques et déduplication
 *
 * RÔLE : Compare chaque constante vitale aux plages de référence et ouvre au
 * plus une alerte active par couple (patient, type d'alerte).
 *
 * SEUILS (la bande la plus sévère gagne) :
 * - fréquence cardiaque : hors [60,100] medium, hors [50,120] high, hors [40,140] critical
 * - température °C : hors [36.0,37.5] medium, hors [35.0,38.0] high, hors [34.0,39.0] critical
 * - couche : wet/soiled low, dry rien
 *
 * DÉDUPLICATION : vérification puis création sous un verrou par couple ;
 * le store refuse en plus un doublon actif (Conflict = déjà ouverte).
 * La résolution des alertes ne passe pas par ce service.
 */

use crate::models::{
    AlertEvent, AlertStatus, DeviceAlert, DiaperStatus, Identity, Severity, VitalReading, VitalRecord,
};
use crate::keyed_lock::KeyedLock;
use crate::store::{PersistenceError, SharedStore};
use tracing::{debug, info};

/// Alerte à ouvrir, avant déduplication
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub device_id: Option<String>,
    pub timestamp: i64,
}

/// Plage [low, high] et sévérité quand la valeur en sort
struct Band {
    low: f64,
    high: f64,
    severity: Severity,
}

// du plus sévère au moins sévère
const HEART_RATE_BANDS: [Band; 3] = [
    Band { low: 40.0, high: 140.0, severity: Severity::Critical },
    Band { low: 50.0, high: 120.0, severity: Severity::High },
    Band { low: 60.0, high: 100.0, severity: Severity::Medium },
];

const TEMPERATURE_BANDS: [Band; 3] = [
    Band { low: 34.0, high: 39.0, severity: Severity::Critical },
    Band { low: 35.0, high: 38.0, severity: Severity::High },
    Band { low: 36.0, high: 37.5, severity: Severity::Medium },
];

fn classify(value: f64, bands: &[Band]) -> Option<Severity> {
    bands
        .iter()
        .find(|band| value < band.low || value > band.high)
        .map(|band| band.severity)
}

/// Évaluation pure d'une constante vitale
pub fn evaluate(record: &VitalRecord) -> Option<AlertCandidate> {
    let (alert_type, severity, title, message) = match &record.reading {
        VitalReading::HeartRate { bpm } => {
            let severity = classify(f64::from(*bpm), &HEART_RATE_BANDS)?;
            let direction = if *bpm < 60 { "low" } else { "high" };
            (
                "heart_rate",
                severity,
                format!("Abnormal heart rate ({direction})"),
                format!("Heart rate {bpm} bpm outside 60-100 bpm"),
            )
        }
        VitalReading::Temperature { celsius } => {
            let severity = classify(*celsius, &TEMPERATURE_BANDS)?;
            let direction = if *celsius < 36.0 { "low" } else { "high" };
            (
                "temperature",
                severity,
                format!("Abnormal temperature ({direction})"),
                format!("Body temperature {celsius:.1} °C outside 36.0-37.5 °C"),
            )
        }
        VitalReading::Diaper { status } => match status {
            DiaperStatus::Dry => return None,
            DiaperStatus::Wet | DiaperStatus::Soiled => (
                "diaper",
                Severity::Low,
                "Diaper needs change".to_string(),
                format!("Diaper reported {}", status.as_str()),
            ),
        },
    };

    Some(AlertCandidate {
        alert_type: alert_type.to_string(),
        severity,
        title,
        message,
        device_id: record.device_id.clone(),
        timestamp: record.timestamp,
    })
}

impl From<DeviceAlert> for AlertCandidate {
    fn from(alert: DeviceAlert) -> Self {
        Self {
            alert_type: alert.alert_type,
            severity: alert.severity,
            title: alert.title,
            message: alert.message,
            device_id: alert.device_id,
            timestamp: alert.timestamp,
        }
    }
}

pub struct AlertService {
    store: SharedStore,
    /// (internal_id, alert_type) -> verrou check-then-create
    locks: KeyedLock<(String, String)>,
}

impl AlertService {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            locks: KeyedLock::new(),
        }
    }

    /// Ouvre l'alerte si aucune n'est active pour ce couple.
    /// `Ok(None)` : une alerte équivalente est déjà ouverte.
    pub async fn raise(
        &self,
        identity: &Identity,
        candidate: AlertCandidate,
    ) -> Result<Option<AlertEvent>, PersistenceError> {
        let key = (identity.internal_id.clone(), candidate.alert_type.clone());
        self.locks.run(key, self.open(identity, candidate)).await
    }

    async fn open(
        &self,
        identity: &Identity,
        candidate: AlertCandidate,
    ) -> Result<Option<AlertEvent>, PersistenceError> {
        if self
            .store
            .find_active_alert(&identity.internal_id, &candidate.alert_type)
            .await?
            .is_some()
        {
            debug!("[alerts] {} alert already open for {}", candidate.alert_type, identity.external_id);
            return Ok(None);
        }

        let event = AlertEvent {
            id: uuid::Uuid::new_v4().to_string(),
            internal_patient_id: identity.internal_id.clone(),
            alert_type: candidate.alert_type,
            severity: candidate.severity,
            title: candidate.title,
            message: candidate.message,
            device_id: candidate.device_id,
            triggered_at: candidate.timestamp,
            status: AlertStatus::Active,
        };

        match self.store.insert_alert(&event).await {
            Ok(()) => {
                info!(
                    "[alerts] {} {} alert for {}",
                    event.severity.as_str(),
                    event.alert_type,
                    identity.external_id
                );
                Ok(Some(event))
            }
            Err(PersistenceError::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Quality;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn vital(reading: VitalReading) -> VitalRecord {
        VitalRecord {
            external_patient_id: "p1".into(),
            reading,
            quality: Quality::Good,
            device_id: Some("band-7".into()),
            timestamp: 1_700_000_000,
        }
    }

    fn severity_of(reading: VitalReading) -> Option<Severity> {
        evaluate(&vital(reading)).map(|c| c.severity)
    }

    #[test]
    fn heart_rate_bands() {
        assert_eq!(severity_of(VitalReading::HeartRate { bpm: 45 }), Some(Severity::High));
        assert_eq!(severity_of(VitalReading::HeartRate { bpm: 75 }), None);
        assert_eq!(severity_of(VitalReading::HeartRate { bpm: 35 }), Some(Severity::Critical));
        assert_eq!(severity_of(VitalReading::HeartRate { bpm: 105 }), Some(Severity::Medium));
        assert_eq!(severity_of(VitalReading::HeartRate { bpm: 60 }), None);
        assert_eq!(severity_of(VitalReading::HeartRate { bpm: 150 }), Some(Severity::Critical));
    }

    #[test]
    fn temperature_bands() {
        assert_eq!(severity_of(VitalReading::Temperature { celsius: 39.5 }), Some(Severity::Critical));
        assert_eq!(severity_of(VitalReading::Temperature { celsius: 36.8 }), None);
        assert_eq!(severity_of(VitalReading::Temperature { celsius: 37.8 }), Some(Severity::Medium));
        assert_eq!(severity_of(VitalReading::Temperature { celsius: 34.5 }), Some(Severity::High));
    }

    #[test]
    fn diaper_status() {
        let soiled = evaluate(&vital(VitalReading::Diaper { status: DiaperStatus::Soiled })).unwrap();
        assert_eq!(soiled.severity, Severity::Low);
        assert_eq!(soiled.alert_type, "diaper");
        assert_eq!(soiled.device_id.as_deref(), Some("band-7"));
        assert!(evaluate(&vital(VitalReading::Diaper { status: DiaperStatus::Dry })).is_none());
    }

    async fn identity(store: &SharedStore) -> Identity {
        store.create_identity("p1", "Patient p1").await.unwrap()
    }

    #[tokio::test]
    async fn repeated_reading_opens_one_alert() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let service = AlertService::new(store.clone());
        let who = identity(&store).await;

        let candidate = evaluate(&vital(VitalReading::HeartRate { bpm: 45 })).unwrap();
        assert!(service.raise(&who, candidate.clone()).await.unwrap().is_some());
        assert!(service.raise(&who, candidate).await.unwrap().is_none());

        let active = store.list_alerts(Some(AlertStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::High);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_raises_open_one_alert() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let service = Arc::new(AlertService::new(store.clone()));
        let who = identity(&store).await;
        let candidate = evaluate(&vital(VitalReading::Temperature { celsius: 39.5 })).unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let service = service.clone();
            let who = who.clone();
            let candidate = candidate.clone();
            handles.push(tokio::spawn(async move { service.raise(&who, candidate).await.unwrap() }));
        }
        let mut opened = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(store.list_alerts(Some(AlertStatus::Active)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_types_are_independent() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let service = AlertService::new(store.clone());
        let who = identity(&store).await;
        let hr = evaluate(&vital(VitalReading::HeartRate { bpm: 35 })).unwrap();
        let temp = evaluate(&vital(VitalReading::Temperature { celsius: 39.5 })).unwrap();
        assert!(service.raise(&who, hr).await.unwrap().is_some());
        assert!(service.raise(&who, temp).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn device_alert_types_do_not_pin_locks() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let service = AlertService::new(store.clone());
        let who = identity(&store).await;
        for i in 0..1000 {
            let candidate = AlertCandidate {
                alert_type: format!("vendor-{i}"),
                severity: Severity::Low,
                title: "t".into(),
                message: "m".into(),
                device_id: None,
                timestamp: 1,
            };
            assert!(service.raise(&who, candidate).await.unwrap().is_some());
        }
        assert_eq!(service.locks.len(), 0);
        assert_eq!(store.list_alerts(None).await.unwrap().len(), 1000);
    }
}
