use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttSettings,
    pub topics: InboundTopics,
    pub outbound: OutboundTopics,
    /// Table tag UWB numérique -> identifiant patient externe
    pub tags: HashMap<u32, String>,
    pub heartbeat_interval_secs: u64,
    pub http: HttpConf,
    pub store: StoreConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttSettings {
    pub subscriber: BrokerConf,
    pub publisher: BrokerConf,
    pub reconnect_delay_secs: u64,
    /// Délai laissé aux boucles pour envoyer le DISCONNECT à l'arrêt
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrokerConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    /// CA PEM ; sans CA on utilise les racines du système
    #[serde(default)]
    pub ca_path: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InboundTopics {
    pub positioning: String,
    pub health_envelope: String,
    pub heart_rate: String,
    pub temperature: String,
    pub diaper: String,
    pub alert: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutboundTopics {
    pub location: String,
    pub heart_rate: String,
    pub temperature: String,
    pub diaper: String,
    pub alert: String,
    pub health_status: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConf {
    Memory,
    Sqlite { path: String },
}

fn default_keep_alive() -> u64 {
    15
}

impl BrokerConf {
    fn local(client_id: &str) -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: client_id.into(),
            username: None,
            password: None,
            tls: false,
            ca_path: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            subscriber: BrokerConf::local("carebridge-ingest"),
            publisher: BrokerConf::local("carebridge-publish"),
            reconnect_delay_secs: 5,
            shutdown_grace_secs: 2,
        }
    }
}

impl MqttSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for InboundTopics {
    fn default() -> Self {
        Self {
            positioning: "uwb/site-01/positions".into(),
            health_envelope: "gateway/+/health".into(),
            heart_rate: "health/heartrate/+".into(),
            temperature: "health/temperature/+".into(),
            diaper: "health/diaper/+".into(),
            alert: "health/alert/+".into(),
        }
    }
}

impl InboundTopics {
    /// Tous les filtres à souscrire (QoS 1)
    pub fn patterns(&self) -> Vec<String> {
        vec![
            self.positioning.clone(),
            self.health_envelope.clone(),
            self.heart_rate.clone(),
            self.temperature.clone(),
            self.diaper.clone(),
            self.alert.clone(),
        ]
    }
}

impl Default for OutboundTopics {
    fn default() -> Self {
        Self {
            location: "app/location".into(),
            heart_rate: "app/heart_rate".into(),
            temperature: "app/temperature".into(),
            diaper: "app/diaper".into(),
            alert: "app/alert".into(),
            health_status: "app/health_status".into(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        StoreConf::Memory
    }
}

pub fn default_tag_table() -> HashMap<u32, String> {
    HashMap::from([
        (1770, "device_001".to_string()),
        (13402, "device_002".to_string()),
    ])
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttSettings::default(),
            topics: InboundTopics::default(),
            outbound: OutboundTopics::default(),
            tags: default_tag_table(),
            heartbeat_interval_secs: 30,
            http: HttpConf::default(),
            store: StoreConf::default(),
        }
    }
}

impl KernelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Les identifiants broker peuvent venir de l'environnement (.env)
    fn apply_env_overrides(&mut self) {
        let username = std::env::var("CAREBRIDGE_MQTT_USERNAME").ok();
        let password = std::env::var("CAREBRIDGE_MQTT_PASSWORD").ok();
        for broker in [&mut self.mqtt.subscriber, &mut self.mqtt.publisher] {
            if let Some(u) = &username {
                broker.username = Some(u.clone());
            }
            if let Some(p) = &password {
                broker.password = Some(p.clone());
            }
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("CAREBRIDGE_CONFIG").unwrap_or_else(|_| "carebridge.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[config] invalid {path}: {e}, using defaults");
            KernelConfig::default()
        })
    } else {
        warn!("[config] no {path}, using defaults");
        KernelConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}
