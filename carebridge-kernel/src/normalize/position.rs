//! Trames de positionnement UWB.
//!
//! Format passerelle :
//! ```json
//! {"tagId": 1770, "tagIdHex": "6ea",
//!  "position": {"x": 1.2, "y": 3.4, "z": 0.0, "quality": 87},
//!  "area": "ward-a", "timestamp": 1718000000}
//! ```

use super::DecodeError;
use crate::config::default_tag_table;
use crate::models::PositionRecord;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionFrame {
    tag_id: u32,
    #[serde(default)]
    tag_id_hex: Option<String>,
    position: PositionBlock,
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PositionBlock {
    x: f64,
    y: f64,
    #[serde(default)]
    z: f64,
    quality: u8,
}

/// Table statique tag numérique -> identifiant patient externe
#[derive(Debug, Clone)]
pub struct TagTable {
    known: HashMap<u32, String>,
}

impl TagTable {
    pub fn new(known: HashMap<u32, String>) -> Self {
        Self { known }
    }

    /// Un tag absent de la table donne `device_unknown_<id>` au lieu d'échouer
    pub fn external_id(&self, tag_id: u32) -> String {
        self.known
            .get(&tag_id)
            .cloned()
            .unwrap_or_else(|| format!("device_unknown_{tag_id}"))
    }

    pub fn is_known(&self, tag_id: u32) -> bool {
        self.known.contains_key(&tag_id)
    }
}

impl Default for TagTable {
    fn default() -> Self {
        Self::new(default_tag_table())
    }
}

pub fn normalize_frame(
    payload: &[u8],
    tags: &TagTable,
    received_at: i64,
) -> Result<PositionRecord, DecodeError> {
    let frame: PositionFrame = serde_json::from_slice(payload)?;

    if let Some(hex) = frame.tag_id_hex.as_deref() {
        let digits = hex.trim_start_matches("0x").trim_start_matches("0X");
        match u32::from_str_radix(digits, 16) {
            Ok(parsed) if parsed == frame.tag_id => {}
            _ => debug!(
                "[position] tag hex {hex} does not match tag id {}, keeping numeric id",
                frame.tag_id
            ),
        }
    }

    if !tags.is_known(frame.tag_id) {
        debug!("[position] tag {} not in lookup table", frame.tag_id);
    }

    Ok(PositionRecord {
        external_device_id: tags.external_id(frame.tag_id),
        tag_id: frame.tag_id,
        x: frame.position.x,
        y: frame.position.y,
        z: frame.position.z,
        accuracy: f64::from(frame.position.quality),
        area: frame.area,
        timestamp: frame.timestamp.unwrap_or(received_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u32, hex: &str) -> String {
        format!(
            r#"{{"tagId":{tag},"tagIdHex":"{hex}","position":{{"x":1.5,"y":-2.25,"z":0.8,"quality":7}},"area":"ward-a","timestamp":1718000000}}"#
        )
    }

    #[test]
    fn known_tags_map_to_documented_ids() {
        let tags = TagTable::default();
        let rec = normalize_frame(frame(1770, "6ea").as_bytes(), &tags, 0).unwrap();
        assert_eq!(rec.external_device_id, "device_001");
        assert_eq!(rec.tag_id, 1770);
        assert_eq!(rec.tag_hex(), "6ea");
        assert_eq!(rec.accuracy, 7.0);
        assert_eq!(rec.x, 1.5);
        assert_eq!(rec.y, -2.25);
        assert_eq!(rec.area.as_deref(), Some("ward-a"));
        assert_eq!(rec.timestamp, 1_718_000_000);

        let rec = normalize_frame(frame(13402, "345a").as_bytes(), &tags, 0).unwrap();
        assert_eq!(rec.external_device_id, "device_002");
    }

    #[test]
    fn unknown_tags_get_a_synthetic_id() {
        let tags = TagTable::default();
        let rec = normalize_frame(frame(99, "63").as_bytes(), &tags, 0).unwrap();
        assert_eq!(rec.external_device_id, "device_unknown_99");
        assert!(!tags.is_known(99));
    }

    #[test]
    fn mismatching_hex_keeps_numeric_id() {
        let tags = TagTable::default();
        let rec = normalize_frame(frame(1770, "ffff").as_bytes(), &tags, 0).unwrap();
        assert_eq!(rec.external_device_id, "device_001");
    }

    #[test]
    fn optional_fields_default() {
        let payload = br#"{"tagId":5,"position":{"x":0.0,"y":1.0,"quality":3}}"#;
        let rec = normalize_frame(payload, &TagTable::default(), 1234).unwrap();
        assert_eq!(rec.z, 0.0);
        assert_eq!(rec.area, None);
        assert_eq!(rec.timestamp, 1234);
    }

    #[test]
    fn missing_position_block_is_rejected() {
        let payload = br#"{"tagId":5,"tagIdHex":"5"}"#;
        assert!(normalize_frame(payload, &TagTable::default(), 0).is_err());
    }
}
