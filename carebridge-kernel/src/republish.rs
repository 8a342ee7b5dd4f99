/**
 * DOWNSTREAM REPUBLISHER - Formats applicatifs sur le broker
 *
 * RÔLE : Sérialise les enregistrements canoniques dans les formats attendus
 * par les applications (JSON camelCase) et les publie en QoS 1.
 *
 * Une publication ratée est journalisée puis abandonnée : ni retry, ni
 * attente qui bloquerait la persistance ou la diffusion live.
 */

use crate::config::OutboundTopics;
use crate::identity::IdentitySummary;
use crate::models::{AlertEvent, PositionRecord, VitalReading, VitalRecord};
use crate::mqtt::{PublishError, Publisher};
use rumqttc::QoS;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub patient_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    /// Tag UWB en hexadécimal
    pub device_id: String,
    pub timestamp: i64,
}

impl From<&PositionRecord> for LocationUpdate {
    fn from(record: &PositionRecord) -> Self {
        Self {
            patient_id: record.external_device_id.clone(),
            x: record.x,
            y: record.y,
            z: record.z,
            accuracy: record.accuracy,
            area: record.area.clone(),
            device_id: record.tag_hex(),
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateUpdate {
    pub patient_id: String,
    pub heart_rate: u32,
    pub quality: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureUpdate {
    pub patient_id: String,
    pub temperature: f64,
    pub unit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiaperUpdate {
    pub patient_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum VitalUpdate {
    HeartRate(HeartRateUpdate),
    Temperature(TemperatureUpdate),
    Diaper(DiaperUpdate),
}

impl VitalUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            VitalUpdate::HeartRate(_) => "heart_rate",
            VitalUpdate::Temperature(_) => "temperature",
            VitalUpdate::Diaper(_) => "diaper",
        }
    }
}

impl From<&VitalRecord> for VitalUpdate {
    fn from(record: &VitalRecord) -> Self {
        let patient_id = record.external_patient_id.clone();
        let device_id = record.device_id.clone();
        let timestamp = record.timestamp;
        match &record.reading {
            VitalReading::HeartRate { bpm } => VitalUpdate::HeartRate(HeartRateUpdate {
                patient_id,
                heart_rate: *bpm,
                quality: record.quality.as_str(),
                device_id,
                timestamp,
            }),
            VitalReading::Temperature { celsius } => VitalUpdate::Temperature(TemperatureUpdate {
                patient_id,
                temperature: *celsius,
                unit: record.reading.unit(),
                device_id,
                timestamp,
            }),
            VitalReading::Diaper { status } => VitalUpdate::Diaper(DiaperUpdate {
                patient_id,
                status: status.as_str(),
                device_id,
                timestamp,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotice {
    pub patient_id: String,
    pub alert_type: String,
    pub title: String,
    pub message: String,
    pub severity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub timestamp: i64,
}

impl AlertNotice {
    pub fn new(external_patient_id: &str, alert: &AlertEvent) -> Self {
        Self {
            patient_id: external_patient_id.to_string(),
            alert_type: alert.alert_type.clone(),
            title: alert.title.clone(),
            message: alert.message.clone(),
            severity: alert.severity.as_str(),
            device_id: alert.device_id.clone(),
            timestamp: alert.triggered_at,
        }
    }
}

/// Instantané publié par le heartbeat
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub identity_count: usize,
    pub patients: Vec<IdentitySummary>,
    pub processed: u64,
    pub rejected: u64,
    pub timestamp: i64,
}

pub struct Republisher {
    publisher: Arc<dyn Publisher>,
    topics: OutboundTopics,
}

impl Republisher {
    pub fn new(publisher: Arc<dyn Publisher>, topics: OutboundTopics) -> Self {
        Self { publisher, topics }
    }

    pub async fn republish_position(&self, update: &LocationUpdate) -> bool {
        self.send(&self.topics.location, update).await
    }

    pub async fn republish_vital(&self, update: &VitalUpdate) -> bool {
        let topic = match update {
            VitalUpdate::HeartRate(_) => &self.topics.heart_rate,
            VitalUpdate::Temperature(_) => &self.topics.temperature,
            VitalUpdate::Diaper(_) => &self.topics.diaper,
        };
        self.send(topic, update).await
    }

    pub async fn republish_alert(&self, notice: &AlertNotice) -> bool {
        self.send(&self.topics.alert, notice).await
    }

    pub async fn publish_health_status(&self, status: &HealthStatus) -> bool {
        self.send(&self.topics.health_status, status).await
    }

    async fn send<T: Serialize + Sync>(&self, topic: &str, body: &T) -> bool {
        match self.try_send(topic, body).await {
            Ok(()) => {
                debug!("[republish] {}", topic);
                true
            }
            Err(e) => {
                warn!("[republish] {} dropped: {}", topic, e);
                false
            }
        }
    }

    async fn try_send<T: Serialize + Sync>(&self, topic: &str, body: &T) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(body)?;
        self.publisher.publish(topic, payload, QoS::AtLeastOnce).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertStatus, DiaperStatus, Quality, Severity};
    use carebridge_devkit::MockMqttClient;
    use serde_json::Value;

    fn republisher(mock: &MockMqttClient) -> Republisher {
        Republisher::new(Arc::new(mock.clone()), OutboundTopics::default())
    }

    #[tokio::test]
    async fn heart_rate_wire_shape() {
        let mock = MockMqttClient::new();
        let record = VitalRecord {
            external_patient_id: "p1".into(),
            reading: VitalReading::HeartRate { bpm: 72 },
            quality: Quality::Fair,
            device_id: Some("band-1".into()),
            timestamp: 1_700_000_000,
        };
        assert!(republisher(&mock).republish_vital(&VitalUpdate::from(&record)).await);

        let body: Value = mock.get_last_json_message("app/heart_rate").unwrap().unwrap();
        assert_eq!(body["patientId"], "p1");
        assert_eq!(body["heartRate"], 72);
        assert_eq!(body["quality"], "fair");
        assert_eq!(body["deviceId"], "band-1");
        assert_eq!(body["timestamp"], 1_700_000_000);
        assert_eq!(mock.get_published_messages()[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn temperature_and_diaper_topics() {
        let mock = MockMqttClient::new();
        let rep = republisher(&mock);
        let temp = VitalRecord {
            external_patient_id: "p2".into(),
            reading: VitalReading::Temperature { celsius: 37.2 },
            quality: Quality::Good,
            device_id: None,
            timestamp: 5,
        };
        let diaper = VitalRecord {
            reading: VitalReading::Diaper { status: DiaperStatus::Wet },
            ..temp.clone()
        };
        rep.republish_vital(&VitalUpdate::from(&temp)).await;
        rep.republish_vital(&VitalUpdate::from(&diaper)).await;

        let t: Value = mock.get_last_json_message("app/temperature").unwrap().unwrap();
        assert_eq!(t["temperature"], 37.2);
        assert_eq!(t["unit"], "C");
        assert!(t.get("deviceId").is_none());
        let d: Value = mock.get_last_json_message("app/diaper").unwrap().unwrap();
        assert_eq!(d["status"], "wet");
    }

    #[tokio::test]
    async fn location_and_alert_shapes() {
        let mock = MockMqttClient::new();
        let rep = republisher(&mock);
        let position = PositionRecord {
            external_device_id: "device_001".into(),
            tag_id: 1770,
            x: 3.5,
            y: 1.25,
            z: 0.0,
            accuracy: 92.0,
            area: Some("room-12".into()),
            timestamp: 9,
        };
        rep.republish_position(&LocationUpdate::from(&position)).await;
        let loc: Value = mock.get_last_json_message("app/location").unwrap().unwrap();
        assert_eq!(loc["patientId"], "device_001");
        assert_eq!(loc["accuracy"], 92.0);
        assert_eq!(loc["area"], "room-12");
        assert_eq!(loc["deviceId"], "6ea");
        assert_eq!(loc["z"], 0.0);

        let alert = AlertEvent {
            id: "a1".into(),
            internal_patient_id: "internal".into(),
            alert_type: "heart_rate".into(),
            severity: Severity::Critical,
            title: "Abnormal heart rate (low)".into(),
            message: "Heart rate 35 bpm outside 60-100 bpm".into(),
            device_id: None,
            triggered_at: 11,
            status: AlertStatus::Active,
        };
        rep.republish_alert(&AlertNotice::new("p1", &alert)).await;
        let a: Value = mock.get_last_json_message("app/alert").unwrap().unwrap();
        assert_eq!(a["patientId"], "p1");
        assert_eq!(a["alertType"], "heart_rate");
        assert_eq!(a["severity"], "critical");
    }
}
