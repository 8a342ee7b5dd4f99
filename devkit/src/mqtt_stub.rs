/*!
Mock MQTT Client pour développement sans broker

Remplace le lien publisher du kernel dans les tests : enregistre tout ce qui
est publié, peut simuler un broker indisponible, et relaie les messages
"terrain" simulés vers un channel que le test branche sur le pipeline.
*/

use anyhow::Result;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT Client qui simule rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
    offline: Arc<AtomicBool>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Channel recevant les messages terrain simulés
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *locked(&self.message_sender) = Some(sender);
        receiver
    }

    /// Simule un broker injoignable : toute publication échoue
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Même signature que AsyncClient::publish
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("mock broker offline, dropped publish to {}", topic);
        }

        let message = MockMessage {
            topic,
            payload: payload.into(),
            qos,
            retain,
        };
        log::info!("📤 [MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        locked(&self.published_messages).push(message);
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::info!("📥 [MOCK] Subscribed to {}", topic);
        locked(&self.subscriptions).push(topic);
        Ok(())
    }

    /// Injecte un message comme s'il venait d'une passerelle terrain
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        match locked(&self.message_sender).as_ref() {
            Some(sender) => sender
                .send(message.clone())
                .map_err(|e| anyhow::anyhow!("Send error: {}", e))?,
            None => anyhow::bail!("no receiver set up for simulated messages"),
        }

        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        locked(&self.published_messages).clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        locked(&self.subscriptions).clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        locked(&self.published_messages)
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Dernier message d'un topic, décodé en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        locked(&self.published_messages).clear();
        locked(&self.subscriptions).clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Topics entrants par défaut du kernel
pub mod topics {
    pub const POSITIONS: &str = "uwb/site-01/positions";

    pub fn gateway_health(gateway_id: &str) -> String {
        format!("gateway/{gateway_id}/health")
    }

    pub fn heart_rate(patient_id: &str) -> String {
        format!("health/heartrate/{patient_id}")
    }

    pub fn temperature(patient_id: &str) -> String {
        format!("health/temperature/{patient_id}")
    }

    pub fn diaper(patient_id: &str) -> String {
        format!("health/diaper/{patient_id}")
    }

    pub fn alert(patient_id: &str) -> String {
        format!("health/alert/{patient_id}")
    }
}

/// Payloads tels que les émettent les passerelles terrain
pub struct TelemetryBuilder;

impl TelemetryBuilder {
    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Trame de positionnement UWB
    pub fn position_frame(tag_id: u32, x: f64, y: f64, quality: u8) -> Value {
        serde_json::json!({
            "tagId": tag_id,
            "tagIdHex": format!("{tag_id:x}"),
            "position": {
                "x": x,
                "y": y,
                "z": 0.0,
                "quality": quality
            },
            "timestamp": Self::now()
        })
    }

    /// Enveloppe cloud "temperature"
    pub fn envelope_temperature(device_id: &str, patient_id: Option<&str>, value: f64, unit: &str, is_abnormal: bool) -> Value {
        let mut env = serde_json::json!({
            "content": "temperature",
            "deviceId": device_id,
            "value": {
                "value": value,
                "unit": unit,
                "is_abnormal": is_abnormal,
                "room_temp": 22.5
            },
            "timestamp": Self::now()
        });
        if let Some(patient_id) = patient_id {
            env["patientId"] = Value::from(patient_id);
        }
        env
    }

    /// Enveloppe cloud "heart_rate"
    pub fn envelope_heart_rate(device_id: &str, patient_id: Option<&str>, bpm: u32) -> Value {
        let mut env = serde_json::json!({
            "content": "heart_rate",
            "deviceId": device_id,
            "value": { "value": bpm, "quality": "good" },
            "timestamp": Self::now()
        });
        if let Some(patient_id) = patient_id {
            env["patientId"] = Value::from(patient_id);
        }
        env
    }

    pub fn heart_rate(bpm: u32, quality: &str) -> Value {
        serde_json::json!({
            "heartRate": bpm,
            "quality": quality,
            "timestamp": Self::now()
        })
    }

    pub fn temperature(value: f64, unit: &str) -> Value {
        serde_json::json!({
            "temperature": value,
            "unit": unit,
            "timestamp": Self::now()
        })
    }

    pub fn diaper(status: &str) -> Value {
        serde_json::json!({
            "status": status,
            "timestamp": Self::now()
        })
    }

    pub fn device_alert(alert_type: &str, severity: &str, title: &str) -> Value {
        serde_json::json!({
            "alertType": alert_type,
            "severity": severity,
            "title": title,
            "timestamp": Self::now()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_recorded() {
        let client = MockMqttClient::new();
        client.subscribe("app/#", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(client.get_subscriptions(), vec!["app/#"]);

        client
            .publish("app/heart_rate", QoS::AtLeastOnce, false, b"{\"heartRate\":72}".to_vec())
            .await
            .unwrap();
        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "app/heart_rate");

        let parsed: Option<Value> = client.get_last_json_message("app/heart_rate").unwrap();
        assert_eq!(parsed.unwrap()["heartRate"], 72);
    }

    #[tokio::test]
    async fn offline_publish_fails() {
        let client = MockMqttClient::new();
        client.set_offline(true);
        assert!(client.publish("app/alert", QoS::AtLeastOnce, false, Vec::new()).await.is_err());
        assert!(client.get_published_messages().is_empty());
        client.set_offline(false);
        assert!(client.publish("app/alert", QoS::AtLeastOnce, false, Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn simulated_messages_reach_receiver() {
        let client = MockMqttClient::new();
        assert!(client.simulate_incoming("x", Vec::new()).await.is_err());
        let mut rx = client.setup_receiver();
        client.simulate_incoming(topics::diaper("p1"), b"{}".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "health/diaper/p1");
    }

    #[test]
    fn builders_match_gateway_shapes() {
        let frame = TelemetryBuilder::position_frame(1770, 1.0, 2.0, 80);
        assert_eq!(frame["tagIdHex"], "6ea");
        assert_eq!(frame["position"]["quality"], 80);

        let env = TelemetryBuilder::envelope_temperature("band-1", Some("p1"), 37.0, "C", false);
        assert_eq!(env["content"], "temperature");
        assert_eq!(env["patientId"], "p1");
        let bare = TelemetryBuilder::envelope_heart_rate("band-2", None, 80);
        assert!(bare.get("patientId").is_none());
    }
}
