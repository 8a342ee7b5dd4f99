/**
 * MODÈLES CANONIQUES - Représentation normalisée de la télémétrie
 *
 * RÔLE : Types partagés par tout le pipeline (normaliseurs, store, alertes,
 * republication, diffusion live). Chaque message terrain devient un de ces
 * enregistrements, quel que soit son format d'origine.
 */

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Message brut reçu du broker, consommé une seule fois par le dispatcher
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Epoch secondes
    pub received_at: i64,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: now_epoch(),
        }
    }
}

/// Position UWB dans le repère local du site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub external_device_id: String,
    /// Identifiant numérique du tag UWB
    pub tag_id: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub accuracy: f64,
    pub area: Option<String>,
    pub timestamp: i64,
}

impl PositionRecord {
    /// Forme hexadécimale du tag, comme l'affichent les passerelles
    pub fn tag_hex(&self) -> String {
        format!("{:x}", self.tag_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalKind {
    HeartRate,
    Temperature,
    Diaper,
}

impl VitalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VitalKind::HeartRate => "heart_rate",
            VitalKind::Temperature => "temperature",
            VitalKind::Diaper => "diaper",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Good,
    Fair,
    Poor,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Fair => "fair",
            Quality::Poor => "poor",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "good" => Some(Quality::Good),
            "fair" => Some(Quality::Fair),
            "poor" => Some(Quality::Poor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiaperStatus {
    Dry,
    Wet,
    Soiled,
}

impl DiaperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiaperStatus::Dry => "dry",
            DiaperStatus::Wet => "wet",
            DiaperStatus::Soiled => "soiled",
        }
    }
}

/// Valeur mesurée, une variante par type de constante vitale.
/// Les températures sont toujours stockées en °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VitalReading {
    HeartRate { bpm: u32 },
    Temperature { celsius: f64 },
    Diaper { status: DiaperStatus },
}

impl VitalReading {
    pub fn kind(&self) -> VitalKind {
        match self {
            VitalReading::HeartRate { .. } => VitalKind::HeartRate,
            VitalReading::Temperature { .. } => VitalKind::Temperature,
            VitalReading::Diaper { .. } => VitalKind::Diaper,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            VitalReading::HeartRate { .. } => "bpm",
            VitalReading::Temperature { .. } => "C",
            VitalReading::Diaper { .. } => "status",
        }
    }

    /// Valeur numérique pour le stockage (None pour les statuts)
    pub fn numeric(&self) -> Option<f64> {
        match self {
            VitalReading::HeartRate { bpm } => Some(f64::from(*bpm)),
            VitalReading::Temperature { celsius } => Some(*celsius),
            VitalReading::Diaper { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalRecord {
    pub external_patient_id: String,
    pub reading: VitalReading,
    pub quality: Quality,
    pub device_id: Option<String>,
    pub timestamp: i64,
}

/// Identité patient/dispositif, créée à la volée au premier message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub internal_id: String,
    pub external_id: String,
    pub display_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" | "info" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AlertStatus::Active),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub internal_patient_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub device_id: Option<String>,
    pub triggered_at: i64,
    pub status: AlertStatus,
}

/// Alerte remontée directement par un dispositif (bouton SOS, chute...)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAlert {
    pub external_patient_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub device_id: Option<String>,
    pub timestamp: i64,
}

/// Sortie d'un normaliseur
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    Position(PositionRecord),
    Vital(VitalRecord),
    Alert(DeviceAlert),
}

pub fn now_epoch() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
