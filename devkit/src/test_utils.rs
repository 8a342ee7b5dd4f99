/*!
Test Harness pour le pipeline CareBridge

- mock MQTT côté publication (le kernel y republie)
- injection de télémétrie terrain au format des passerelles
- assertions sur les messages republiés
*/

use crate::mqtt_stub::{topics, MockMessage, MockMqttClient, TelemetryBuilder};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            mqtt_client: MockMqttClient::new(),
            expectations: Vec::new(),
        }
    }

    /// Channel sur lequel arrivent les messages envoyés par `send_*`
    pub fn incoming(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        self.mqtt_client.setup_receiver()
    }

    /// On s'attend à exactement `count` messages republiés sur `topic`
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub async fn send_json(&self, topic: &str, payload: &Value) -> Result<()> {
        self.mqtt_client
            .simulate_incoming(topic, serde_json::to_vec(payload)?)
            .await
    }

    pub async fn send_position(&self, tag_id: u32, x: f64, y: f64) -> Result<()> {
        let frame = TelemetryBuilder::position_frame(tag_id, x, y, 90);
        self.send_json(topics::POSITIONS, &frame).await?;
        log::info!("📍 Sent position for tag {}", tag_id);
        Ok(())
    }

    pub async fn send_heart_rate(&self, patient_id: &str, bpm: u32) -> Result<()> {
        self.send_json(&topics::heart_rate(patient_id), &TelemetryBuilder::heart_rate(bpm, "good"))
            .await?;
        log::info!("💓 Sent heart rate {} for {}", bpm, patient_id);
        Ok(())
    }

    pub async fn send_temperature(&self, patient_id: &str, value: f64, unit: &str) -> Result<()> {
        self.send_json(&topics::temperature(patient_id), &TelemetryBuilder::temperature(value, unit))
            .await?;
        log::info!("🌡️ Sent temperature {}{} for {}", value, unit, patient_id);
        Ok(())
    }

    pub async fn send_diaper(&self, patient_id: &str, status: &str) -> Result<()> {
        self.send_json(&topics::diaper(patient_id), &TelemetryBuilder::diaper(status))
            .await
    }

    pub async fn send_device_alert(&self, patient_id: &str, alert_type: &str, severity: &str) -> Result<()> {
        let body = TelemetryBuilder::device_alert(alert_type, severity, alert_type);
        self.send_json(&topics::alert(patient_id), &body).await
    }

    /// Attend un message republié sur `topic`
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        log::warn!("⏰ Timeout waiting for message on {}", topic);
        Ok(None)
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        log::info!("🎉 {} expectations verified", self.expectations.len());
        Ok(())
    }

    /// Vérifie un champ (chemin pointé, ex. `data.heartRate`) du dernier message
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? else {
            anyhow::bail!("No message on {}", topic);
        };
        match nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual),
            None => anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let messages = self.mqtt_client.get_published_messages();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.as_object()?.get(part))
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}
