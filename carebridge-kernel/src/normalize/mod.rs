/**
 * NORMALISEURS - Payload brut → enregistrement canonique
 *
 * RÔLE : Une fonction pure par famille de message. Chaque format terrain est
 * décodé directement dans une structure typée ; un format inconnu est rejeté
 * à la frontière au lieu de propager des maps JSON dans le pipeline.
 *
 * CONTRAT : `Ok(Some(record))` = enregistrement à traiter, `Ok(None)` =
 * message reconnu mais ignoré (discriminant inconnu), `Err(DecodeError)` =
 * payload invalide, à journaliser puis jeter.
 */

pub mod position;
pub mod vitals;

use crate::dispatch::{MessageFamily, Route};
use crate::models::{CanonicalRecord, RawMessage};

pub use position::TagTable;

/// Erreurs de décodage, jamais propagées au-delà du traitement d'un message
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Point d'entrée unique appelé par le pipeline après routage
pub fn normalize(
    route: &Route,
    message: &RawMessage,
    tags: &TagTable,
) -> Result<Option<CanonicalRecord>, DecodeError> {
    let payload = message.payload.as_slice();
    let received_at = message.received_at;
    let trailing = || route.trailing_id.as_deref().ok_or(DecodeError::MissingField("topic id"));

    match route.family {
        MessageFamily::Position => {
            position::normalize_frame(payload, tags, received_at).map(|p| Some(CanonicalRecord::Position(p)))
        }
        MessageFamily::HealthEnvelope => {
            Ok(vitals::normalize_envelope(payload, received_at)?.map(CanonicalRecord::Vital))
        }
        MessageFamily::HeartRate => {
            vitals::normalize_heart_rate(trailing()?, payload, received_at).map(|v| Some(CanonicalRecord::Vital(v)))
        }
        MessageFamily::Temperature => {
            vitals::normalize_temperature(trailing()?, payload, received_at).map(|v| Some(CanonicalRecord::Vital(v)))
        }
        MessageFamily::Diaper => {
            vitals::normalize_diaper(trailing()?, payload, received_at).map(|v| Some(CanonicalRecord::Vital(v)))
        }
        MessageFamily::Alert => {
            vitals::normalize_device_alert(trailing()?, payload, received_at).map(|a| Some(CanonicalRecord::Alert(a)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InboundTopics;
    use crate::dispatch::TopicDispatcher;

    fn run(topic: &str, payload: &str) -> Result<Option<CanonicalRecord>, DecodeError> {
        let dispatcher = TopicDispatcher::new(&InboundTopics::default());
        let route = dispatcher.route(topic).unwrap();
        normalize(&route, &RawMessage::new(topic, payload), &TagTable::default())
    }

    #[test]
    fn routes_each_family_to_its_normalizer() {
        let pos = run(
            "uwb/site-01/positions",
            r#"{"tagId":1770,"tagIdHex":"6ea","position":{"x":1.0,"y":2.0,"z":0.0,"quality":80}}"#,
        )
        .unwrap();
        assert!(matches!(pos, Some(CanonicalRecord::Position(_))));

        let hr = run("health/heartrate/p9", r#"{"heartRate":72,"quality":"good"}"#).unwrap();
        match hr {
            Some(CanonicalRecord::Vital(v)) => assert_eq!(v.external_patient_id, "p9"),
            other => panic!("unexpected {other:?}"),
        }

        let alert = run(
            "health/alert/p9",
            r#"{"alertType":"fall","severity":"critical","title":"Fall","message":"Fall detected"}"#,
        )
        .unwrap();
        assert!(matches!(alert, Some(CanonicalRecord::Alert(_))));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        assert!(matches!(run("health/diaper/p1", "{not json"), Err(DecodeError::Json(_))));
    }
}
