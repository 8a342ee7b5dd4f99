//! Constantes vitales : enveloppe "cloud" des passerelles et topics par famille.
//!
//! L'enveloppe porte un discriminant `content` ; on le lit d'abord, puis on
//! décode la forme typée correspondante. Les topics par famille portent
//! l'identifiant patient dans leur dernier segment, jamais dans le corps.

use super::DecodeError;
use crate::models::{DeviceAlert, DiaperStatus, Quality, Severity, VitalReading, VitalRecord};
use serde::Deserialize;
use tracing::debug;

/// Plage plausible pour une fréquence cardiaque transmise
const MAX_BPM: f64 = 400.0;

#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<V> {
    device_id: String,
    #[serde(default)]
    patient_id: Option<String>,
    value: V,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeTemperature {
    value: f64,
    #[serde(default)]
    unit: Option<String>,
    /// `room_temp` est aussi transmis mais n'entre pas dans l'enregistrement
    #[serde(default)]
    is_abnormal: bool,
}

#[derive(Debug, Deserialize)]
struct EnvelopeHeartRate {
    value: f64,
    #[serde(default)]
    quality: Option<Quality>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartRateBody {
    heart_rate: f64,
    #[serde(default)]
    quality: Option<Quality>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemperatureBody {
    temperature: f64,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    quality: Option<Quality>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiaperBody {
    status: DiaperStatus,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertBody {
    alert_type: String,
    severity: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

pub fn normalize_envelope(payload: &[u8], received_at: i64) -> Result<Option<VitalRecord>, DecodeError> {
    let header: EnvelopeHeader = serde_json::from_slice(payload)?;
    match header.content.as_str() {
        "temperature" => {
            let env: Envelope<EnvelopeTemperature> = serde_json::from_slice(payload)?;
            let celsius = to_celsius(env.value.value, env.value.unit.as_deref())?;
            let quality = if env.value.is_abnormal { Quality::Poor } else { Quality::Good };
            Ok(Some(VitalRecord {
                external_patient_id: env.patient_id.unwrap_or_else(|| env.device_id.clone()),
                reading: VitalReading::Temperature { celsius },
                quality,
                device_id: Some(env.device_id),
                timestamp: env.timestamp.unwrap_or(received_at),
            }))
        }
        "heart_rate" => {
            let env: Envelope<EnvelopeHeartRate> = serde_json::from_slice(payload)?;
            let bpm = bpm_from(env.value.value)?;
            Ok(Some(VitalRecord {
                external_patient_id: env.patient_id.unwrap_or_else(|| env.device_id.clone()),
                reading: VitalReading::HeartRate { bpm },
                quality: env.value.quality.unwrap_or_default(),
                device_id: Some(env.device_id),
                timestamp: env.timestamp.unwrap_or(received_at),
            }))
        }
        other => {
            debug!("[vitals] ignoring envelope with content '{other}'");
            Ok(None)
        }
    }
}

pub fn normalize_heart_rate(patient_id: &str, payload: &[u8], received_at: i64) -> Result<VitalRecord, DecodeError> {
    let body: HeartRateBody = serde_json::from_slice(payload)?;
    Ok(VitalRecord {
        external_patient_id: patient_id.to_string(),
        reading: VitalReading::HeartRate { bpm: bpm_from(body.heart_rate)? },
        quality: body.quality.unwrap_or_default(),
        device_id: body.device_id,
        timestamp: body.timestamp.unwrap_or(received_at),
    })
}

pub fn normalize_temperature(patient_id: &str, payload: &[u8], received_at: i64) -> Result<VitalRecord, DecodeError> {
    let body: TemperatureBody = serde_json::from_slice(payload)?;
    Ok(VitalRecord {
        external_patient_id: patient_id.to_string(),
        reading: VitalReading::Temperature { celsius: to_celsius(body.temperature, body.unit.as_deref())? },
        quality: body.quality.unwrap_or_default(),
        device_id: body.device_id,
        timestamp: body.timestamp.unwrap_or(received_at),
    })
}

pub fn normalize_diaper(patient_id: &str, payload: &[u8], received_at: i64) -> Result<VitalRecord, DecodeError> {
    let body: DiaperBody = serde_json::from_slice(payload)?;
    Ok(VitalRecord {
        external_patient_id: patient_id.to_string(),
        reading: VitalReading::Diaper { status: body.status },
        quality: Quality::Good,
        device_id: body.device_id,
        timestamp: body.timestamp.unwrap_or(received_at),
    })
}

pub fn normalize_device_alert(patient_id: &str, payload: &[u8], received_at: i64) -> Result<DeviceAlert, DecodeError> {
    let body: AlertBody = serde_json::from_slice(payload)?;
    if body.alert_type.trim().is_empty() {
        return Err(DecodeError::MissingField("alertType"));
    }
    let severity = Severity::parse(&body.severity.to_lowercase()).ok_or(DecodeError::InvalidValue {
        field: "severity",
        value: body.severity.clone(),
    })?;
    let title = body.title.unwrap_or_else(|| body.alert_type.clone());
    Ok(DeviceAlert {
        external_patient_id: patient_id.to_string(),
        message: body.message.unwrap_or_else(|| title.clone()),
        title,
        alert_type: body.alert_type,
        severity,
        device_id: body.device_id,
        timestamp: body.timestamp.unwrap_or(received_at),
    })
}

fn bpm_from(value: f64) -> Result<u32, DecodeError> {
    if !value.is_finite() || !(0.0..=MAX_BPM).contains(&value) {
        return Err(DecodeError::InvalidValue { field: "heartRate", value: value.to_string() });
    }
    Ok(value.round() as u32)
}

/// Sans unité on suppose des degrés Celsius
fn to_celsius(value: f64, unit: Option<&str>) -> Result<f64, DecodeError> {
    if !value.is_finite() {
        return Err(DecodeError::InvalidValue { field: "temperature", value: value.to_string() });
    }
    match unit.map(|u| u.trim().trim_start_matches('°').to_ascii_lowercase()).as_deref() {
        None | Some("c") | Some("celsius") => Ok(value),
        Some("f") | Some("fahrenheit") => Ok((value - 32.0) * 5.0 / 9.0),
        Some(other) => Err(DecodeError::InvalidValue { field: "unit", value: other.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_temperature_abnormal_maps_to_poor() {
        let payload = br#"{"content":"temperature","deviceId":"band-7","patientId":"p1",
            "value":{"value":38.4,"unit":"C","is_abnormal":true,"room_temp":22.0},"timestamp":1700000000}"#;
        let rec = normalize_envelope(payload, 0).unwrap().unwrap();
        assert_eq!(rec.external_patient_id, "p1");
        assert_eq!(rec.quality, Quality::Poor);
        assert_eq!(rec.reading, VitalReading::Temperature { celsius: 38.4 });
        assert_eq!(rec.device_id.as_deref(), Some("band-7"));
        assert_eq!(rec.timestamp, 1_700_000_000);
    }

    #[test]
    fn envelope_without_patient_falls_back_to_device() {
        let payload = br#"{"content":"temperature","deviceId":"band-7","value":{"value":36.6,"unit":"C","is_abnormal":false}}"#;
        let rec = normalize_envelope(payload, 55).unwrap().unwrap();
        assert_eq!(rec.external_patient_id, "band-7");
        assert_eq!(rec.quality, Quality::Good);
        assert_eq!(rec.timestamp, 55);
    }

    #[test]
    fn envelope_heart_rate() {
        let payload = br#"{"content":"heart_rate","deviceId":"band-2","value":{"value":81,"quality":"fair"}}"#;
        let rec = normalize_envelope(payload, 0).unwrap().unwrap();
        assert_eq!(rec.reading, VitalReading::HeartRate { bpm: 81 });
        assert_eq!(rec.quality, Quality::Fair);
    }

    #[test]
    fn unknown_discriminator_is_a_no_op() {
        let payload = br#"{"content":"spo2","deviceId":"band-2","value":{"value":97}}"#;
        assert!(normalize_envelope(payload, 0).unwrap().is_none());
    }

    #[test]
    fn envelope_missing_value_is_rejected() {
        let payload = br#"{"content":"temperature","deviceId":"band-2"}"#;
        assert!(normalize_envelope(payload, 0).is_err());
    }

    #[test]
    fn per_family_id_comes_from_topic_not_body() {
        let payload = br#"{"patientId":"ignored","heartRate":64,"quality":"good","deviceId":"hr-1"}"#;
        let rec = normalize_heart_rate("from_topic", payload, 10).unwrap();
        assert_eq!(rec.external_patient_id, "from_topic");
        assert_eq!(rec.reading, VitalReading::HeartRate { bpm: 64 });
        assert_eq!(rec.timestamp, 10);
    }

    #[test]
    fn fahrenheit_is_converted() {
        let rec = normalize_temperature("p", br#"{"temperature":98.6,"unit":"F"}"#, 0).unwrap();
        match rec.reading {
            VitalReading::Temperature { celsius } => assert!((celsius - 37.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert!(normalize_temperature("p", br#"{"temperature":300,"unit":"K"}"#, 0).is_err());
    }

    #[test]
    fn diaper_status_is_typed() {
        let rec = normalize_diaper("p", br#"{"status":"soiled"}"#, 0).unwrap();
        assert_eq!(rec.reading, VitalReading::Diaper { status: DiaperStatus::Soiled });
        assert!(normalize_diaper("p", br#"{"status":"damp"}"#, 0).is_err());
    }

    #[test]
    fn implausible_heart_rate_is_rejected() {
        assert!(normalize_heart_rate("p", br#"{"heartRate":-3}"#, 0).is_err());
        assert!(normalize_heart_rate("p", br#"{"heartRate":1200}"#, 0).is_err());
    }

    #[test]
    fn device_alert_defaults_title_and_message() {
        let alert = normalize_device_alert("p4", br#"{"alertType":"sos","severity":"HIGH"}"#, 9).unwrap();
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.title, "sos");
        assert_eq!(alert.message, "sos");
        assert_eq!(alert.timestamp, 9);
        assert!(normalize_device_alert("p4", br#"{"alertType":"sos","severity":"urgent"}"#, 0).is_err());
    }
}
