/*!
Simulateur de passerelle terrain

Publie sur un vrai broker des trames UWB et des constantes vitales au format
des passerelles, pour faire tourner le kernel sans matériel.

Variables d'environnement :
- GATEWAY_SIM_HOST / GATEWAY_SIM_PORT (localhost:1883)
- GATEWAY_SIM_INTERVAL_MS (1000)
- GATEWAY_SIM_TICKS (0 = sans fin)
*/

use anyhow::Result;
use carebridge_devkit::{topics, TelemetryBuilder};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;

/// Tags connus de la table par défaut, plus un inconnu
const TAGS: [u32; 3] = [1770, 13402, 4242];
const PATIENTS: [&str; 2] = ["device_001", "device_002"];

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let host: String = env_or("GATEWAY_SIM_HOST", "localhost".to_string());
    let port: u16 = env_or("GATEWAY_SIM_PORT", 1883);
    let interval = Duration::from_millis(env_or("GATEWAY_SIM_INTERVAL_MS", 1000));
    let ticks: u64 = env_or("GATEWAY_SIM_TICKS", 0);

    let mut opts = MqttOptions::new("carebridge-gateway-sim", &host, port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                log::warn!("🔌 broker error: {}", e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    log::info!("🛰️ gateway-sim publishing to {}:{} every {:?}", host, port, interval);
    let mut ticker = tokio::time::interval(interval);
    let mut tick: u64 = 0;

    loop {
        ticker.tick().await;
        tick += 1;
        let phase = tick as f64 / 10.0;

        for (i, tag) in TAGS.iter().enumerate() {
            let offset = i as f64 * 2.0;
            let frame = TelemetryBuilder::position_frame(*tag, 5.0 + 3.0 * (phase + offset).cos(), 4.0 + 3.0 * (phase + offset).sin(), 85);
            publish(&client, topics::POSITIONS, &frame).await;
        }

        for (i, patient) in PATIENTS.iter().enumerate() {
            // dérive lente, sortant parfois des plages normales
            let bpm = (80.0 + 35.0 * (phase / 3.0 + i as f64).sin()).round() as u32;
            publish(&client, &topics::heart_rate(patient), &TelemetryBuilder::heart_rate(bpm, "good")).await;

            if tick % 5 == 0 {
                let celsius = 37.0 + 1.5 * (phase / 5.0 + i as f64).sin();
                let env = TelemetryBuilder::envelope_temperature("band-sim", Some(patient), celsius, "C", celsius > 37.5);
                publish(&client, &topics::gateway_health("gw-sim"), &env).await;
            }

            if tick % 30 == 0 {
                let status = if (tick / 30 + i as u64) % 3 == 0 { "wet" } else { "dry" };
                publish(&client, &topics::diaper(patient), &TelemetryBuilder::diaper(status)).await;
            }
        }

        if ticks > 0 && tick >= ticks {
            break;
        }
    }

    client.disconnect().await?;
    log::info!("👋 gateway-sim done after {} ticks", tick);
    Ok(())
}

async fn publish(client: &AsyncClient, topic: &str, payload: &serde_json::Value) {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, bytes).await {
                log::warn!("📤 publish to {} failed: {}", topic, e);
            }
        }
        Err(e) => log::warn!("📤 cannot encode payload for {}: {}", topic, e),
    }
}
