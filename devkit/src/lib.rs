/*!
# CareBridge DevKit - Stubs et utilitaires de développement

- Mock MQTT pour tester le pipeline sans broker
- Payloads au format des passerelles terrain (UWB, enveloppe cloud, vitals)
- Harness de test avec assertions sur les messages republiés
- Binaire `gateway-sim` qui rejoue une passerelle contre un vrai broker
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{topics, MockMessage, MockMqttClient, TelemetryBuilder};
pub use test_utils::TestHarness;
