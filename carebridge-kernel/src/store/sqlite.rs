//! Store `SQLite` (rusqlite).
//!
//! Les garanties du trait reposent sur le schéma :
//! - `identities.external_id` UNIQUE + `ON CONFLICT DO NOTHING`
//! - index unique partiel sur `alerts(patient_id, alert_type) WHERE status = 'active'`
//!
//! Les appels rusqlite sont bloquants ; ils passent par `spawn_blocking`.

use super::{placeholder_identity, PersistenceError, Store, StoredPosition, StoredVital};
use crate::models::{AlertEvent, AlertStatus, Identity, PositionRecord, Quality, Severity, VitalRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    internal_id  TEXT PRIMARY KEY,
    external_id  TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    created_at   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS vitals (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id          TEXT NOT NULL,
    external_patient_id TEXT NOT NULL,
    kind                TEXT NOT NULL,
    value               REAL,
    unit                TEXT NOT NULL,
    quality             TEXT NOT NULL,
    reading             TEXT NOT NULL,
    device_id           TEXT,
    ts                  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS vitals_by_patient ON vitals(patient_id, id);
CREATE TABLE IF NOT EXISTS positions (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id         TEXT NOT NULL,
    external_device_id TEXT NOT NULL,
    tag_id             INTEGER NOT NULL,
    x                  REAL NOT NULL,
    y                  REAL NOT NULL,
    z                  REAL NOT NULL,
    accuracy           REAL NOT NULL,
    area               TEXT,
    ts                 INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS positions_by_patient ON positions(patient_id, id);
CREATE TABLE IF NOT EXISTS alerts (
    id           TEXT PRIMARY KEY,
    patient_id   TEXT NOT NULL,
    alert_type   TEXT NOT NULL,
    severity     TEXT NOT NULL,
    title        TEXT NOT NULL,
    message      TEXT NOT NULL,
    device_id    TEXT,
    triggered_at INTEGER NOT NULL,
    status       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS alerts_one_active
    ON alerts(patient_id, alert_type) WHERE status = 'active';
"#;

const ALERT_COLUMNS: &str =
    "id, patient_id, alert_type, severity, title, message, device_id, triggered_at, status";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?
    }
}

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value '{0}'")]
struct UnknownValue(String);

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        internal_id: row.get(0)?,
        external_id: row.get(1)?,
        display_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<AlertEvent> {
    let severity: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(AlertEvent {
        id: row.get(0)?,
        internal_patient_id: row.get(1)?,
        alert_type: row.get(2)?,
        severity: Severity::parse(&severity).ok_or_else(|| conversion_error(3, UnknownValue(severity.clone())))?,
        title: row.get(4)?,
        message: row.get(5)?,
        device_id: row.get(6)?,
        triggered_at: row.get(7)?,
        status: AlertStatus::parse(&status).ok_or_else(|| conversion_error(8, UnknownValue(status.clone())))?,
    })
}

fn map_constraint(err: rusqlite::Error) -> PersistenceError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            PersistenceError::Conflict(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => PersistenceError::Sqlite(err),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_identity_by_external_id(&self, external_id: &str) -> Result<Option<Identity>, PersistenceError> {
        let external_id = external_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT internal_id, external_id, display_name, created_at FROM identities WHERE external_id = ?1",
                    params![external_id],
                    identity_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn create_identity(&self, external_id: &str, display_name: &str) -> Result<Identity, PersistenceError> {
        let candidate = placeholder_identity(external_id, display_name);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO identities (internal_id, external_id, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT(external_id) DO NOTHING",
                params![candidate.internal_id, candidate.external_id, candidate.display_name, candidate.created_at],
            )?;
            Ok(conn.query_row(
                "SELECT internal_id, external_id, display_name, created_at FROM identities WHERE external_id = ?1",
                params![candidate.external_id],
                identity_from_row,
            )?)
        })
        .await
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, PersistenceError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT internal_id, external_id, display_name, created_at FROM identities ORDER BY external_id",
            )?;
            let rows = stmt.query_map([], identity_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn insert_vital_record(&self, internal_id: &str, record: &VitalRecord) -> Result<(), PersistenceError> {
        let internal_id = internal_id.to_string();
        let record = record.clone();
        let reading = serde_json::to_string(&record.reading)
            .map_err(|e| PersistenceError::Unavailable(format!("cannot encode reading: {e}")))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO vitals (patient_id, external_patient_id, kind, value, unit, quality, reading, device_id, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    internal_id,
                    record.external_patient_id,
                    record.reading.kind().as_str(),
                    record.reading.numeric(),
                    record.reading.unit(),
                    record.quality.as_str(),
                    reading,
                    record.device_id,
                    record.timestamp,
                ],
            )
            .map_err(map_constraint)?;
            Ok(())
        })
        .await
    }

    async fn insert_position_record(&self, internal_id: &str, record: &PositionRecord) -> Result<(), PersistenceError> {
        let internal_id = internal_id.to_string();
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO positions (patient_id, external_device_id, tag_id, x, y, z, accuracy, area, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    internal_id,
                    record.external_device_id,
                    record.tag_id,
                    record.x,
                    record.y,
                    record.z,
                    record.accuracy,
                    record.area,
                    record.timestamp,
                ],
            )
            .map_err(map_constraint)?;
            Ok(())
        })
        .await
    }

    async fn find_active_alert(&self, internal_id: &str, alert_type: &str) -> Result<Option<AlertEvent>, PersistenceError> {
        let internal_id = internal_id.to_string();
        let alert_type = alert_type.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {ALERT_COLUMNS} FROM alerts
                         WHERE patient_id = ?1 AND alert_type = ?2 AND status = 'active'"
                    ),
                    params![internal_id, alert_type],
                    alert_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn insert_alert(&self, alert: &AlertEvent) -> Result<(), PersistenceError> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO alerts ({ALERT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    alert.id,
                    alert.internal_patient_id,
                    alert.alert_type,
                    alert.severity.as_str(),
                    alert.title,
                    alert.message,
                    alert.device_id,
                    alert.triggered_at,
                    alert.status.as_str(),
                ],
            )
            .map_err(map_constraint)?;
            Ok(())
        })
        .await
    }

    async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<AlertEvent>, PersistenceError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE (?1 IS NULL OR status = ?1) ORDER BY triggered_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status.map(|s| s.as_str())], alert_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn recent_vitals(&self, internal_id: &str, limit: usize) -> Result<Vec<StoredVital>, PersistenceError> {
        let internal_id = internal_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT patient_id, external_patient_id, reading, quality, device_id, ts
                 FROM vitals WHERE patient_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![internal_id, limit as i64], |row| {
                let reading: String = row.get(2)?;
                let quality: String = row.get(3)?;
                Ok(StoredVital {
                    internal_patient_id: row.get(0)?,
                    record: VitalRecord {
                        external_patient_id: row.get(1)?,
                        reading: serde_json::from_str(&reading).map_err(|e| conversion_error(2, e))?,
                        quality: Quality::parse(&quality).ok_or_else(|| conversion_error(3, UnknownValue(quality.clone())))?,
                        device_id: row.get(4)?,
                        timestamp: row.get(5)?,
                    },
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn recent_positions(&self, internal_id: &str, limit: usize) -> Result<Vec<StoredPosition>, PersistenceError> {
        let internal_id = internal_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT patient_id, external_device_id, tag_id, x, y, z, accuracy, area, ts
                 FROM positions WHERE patient_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![internal_id, limit as i64], |row| {
                Ok(StoredPosition {
                    internal_patient_id: row.get(0)?,
                    record: PositionRecord {
                        external_device_id: row.get(1)?,
                        tag_id: row.get(2)?,
                        x: row.get(3)?,
                        y: row.get(4)?,
                        z: row.get(5)?,
                        accuracy: row.get(6)?,
                        area: row.get(7)?,
                        timestamp: row.get(8)?,
                    },
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiaperStatus, VitalReading};

    fn active_alert(patient: &str) -> AlertEvent {
        AlertEvent {
            id: uuid::Uuid::new_v4().to_string(),
            internal_patient_id: patient.into(),
            alert_type: "heart_rate".into(),
            severity: Severity::Critical,
            title: "Abnormal heart rate".into(),
            message: "35 bpm".into(),
            device_id: Some("hr-1".into()),
            triggered_at: 100,
            status: AlertStatus::Active,
        }
    }

    #[tokio::test]
    async fn identity_upsert_keeps_first_name() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.create_identity("device_unknown_5", "Tag 5").await.unwrap();
        let b = store.create_identity("device_unknown_5", "Other").await.unwrap();
        assert_eq!(a, b);
        let found = store.find_identity_by_external_id("device_unknown_5").await.unwrap().unwrap();
        assert_eq!(found.display_name, "Tag 5");
        assert!(store.find_identity_by_external_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_unique_index_rejects_second_active_alert() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_alert(&active_alert("p1")).await.unwrap();
        let err = store.insert_alert(&active_alert("p1")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));

        let mut resolved = active_alert("p1");
        resolved.status = AlertStatus::Resolved;
        store.insert_alert(&resolved).await.unwrap();

        let active = store.find_active_alert("p1", "heart_rate").await.unwrap().unwrap();
        assert_eq!(active.severity, Severity::Critical);
        assert_eq!(store.list_alerts(None).await.unwrap().len(), 2);
        assert_eq!(store.list_alerts(Some(AlertStatus::Resolved)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn records_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("carebridge.sqlite")).unwrap();
        let vital = VitalRecord {
            external_patient_id: "p2".into(),
            reading: VitalReading::Diaper { status: DiaperStatus::Wet },
            quality: Quality::Good,
            device_id: None,
            timestamp: 77,
        };
        store.insert_vital_record("id-2", &vital).await.unwrap();
        let position = PositionRecord {
            external_device_id: "device_002".into(),
            tag_id: 13402,
            x: 1.0,
            y: 2.0,
            z: 0.5,
            accuracy: 9.0,
            area: Some("hall".into()),
            timestamp: 78,
        };
        store.insert_position_record("id-2", &position).await.unwrap();

        let vitals = store.recent_vitals("id-2", 10).await.unwrap();
        assert_eq!(vitals[0].record, vital);
        let positions = store.recent_positions("id-2", 10).await.unwrap();
        assert_eq!(positions[0].record, position);
    }
}
