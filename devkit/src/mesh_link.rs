/*!
Mock mesh link for development without a broker or a radio

Records every publish and lets tests push simulated packets to whoever holds
the receiver. Packets can be wrapped in the Meshtastic JSON envelope the radio
bridge emits.
*/

use anyhow::Result;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MeshPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Meshtastic JSON envelope helpers.
pub struct MeshEnvelope;

impl MeshEnvelope {
    /// Text message envelope carrying `text` from node `from`.
    pub fn text(from: u32, text: &str) -> Value {
        Self::wrap(from, "text", serde_json::json!({ "text": text }))
    }

    /// Position report, which carries no telemetry text.
    pub fn position(from: u32, latitude_i: i64, longitude_i: i64) -> Value {
        Self::wrap(
            from,
            "position",
            serde_json::json!({ "latitude_i": latitude_i, "longitude_i": longitude_i }),
        )
    }

    pub fn wrap(from: u32, kind: &str, payload: Value) -> Value {
        serde_json::json!({
            "channel": 0,
            "from": from,
            "sender": format!("!{from:08x}"),
            "to": 4294967295u32,
            "type": kind,
            "timestamp": chrono::Utc::now().timestamp(),
            "payload": payload,
        })
    }

    /// Uplink topic the radio bridge publishes on.
    pub fn topic(region: &str, gateway: &str) -> String {
        format!("msh/{region}/2/json/LongFast/{gateway}")
    }
}

#[derive(Clone, Default)]
pub struct MockMeshLink {
    published: Arc<Mutex<Vec<MeshPacket>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedSender<MeshPacket>>>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockMeshLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel on which simulated incoming packets arrive.
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MeshPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        *locked(&self.incoming) = Some(tx);
        rx
    }

    pub async fn publish<S, V>(&self, topic: S, qos: QoS, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let packet = MeshPacket { topic: topic.into(), payload: payload.into(), qos };
        log::debug!("[mock mesh] published {} bytes to {}", packet.payload.len(), packet.topic);
        locked(&self.published).push(packet);
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, filter: S, _qos: QoS) -> Result<()> {
        let filter = filter.into();
        log::debug!("[mock mesh] subscribed to {}", filter);
        locked(&self.subscriptions).push(filter);
        Ok(())
    }

    /// Pushes a packet to the receiver as if it came off the mesh.
    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let packet = MeshPacket { topic: topic.into(), payload: payload.into(), qos: QoS::AtMostOnce };
        let guard = locked(&self.incoming);
        let Some(tx) = guard.as_ref() else {
            anyhow::bail!("no receiver set up for simulated packets");
        };
        tx.send(packet).map_err(|e| anyhow::anyhow!("receiver dropped: {e}"))?;
        Ok(())
    }

    /// Wraps `text` in a text envelope from node `from` and delivers it.
    pub fn simulate_text(&self, topic: &str, from: u32, text: &str) -> Result<()> {
        let envelope = MeshEnvelope::text(from, text);
        self.simulate_incoming(topic, serde_json::to_vec(&envelope)?)
    }

    pub fn published(&self) -> Vec<MeshPacket> {
        locked(&self.published).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        locked(&self.subscriptions).clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<MeshPacket> {
        locked(&self.published).iter().filter(|p| p.topic == topic).cloned().collect()
    }

    /// Inner text of the last text envelope published on `topic`.
    pub fn last_text(&self, topic: &str) -> Result<Option<String>> {
        let Some(last) = self.published_on(topic).pop() else {
            return Ok(None);
        };
        let envelope: Value = serde_json::from_slice(&last.payload)?;
        Ok(envelope["payload"]["text"].as_str().map(str::to_string))
    }

    pub fn clear(&self) {
        locked(&self.published).clear();
        locked(&self.subscriptions).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryBuilder;

    #[tokio::test]
    async fn records_publishes_and_subscriptions() {
        let link = MockMeshLink::new();
        link.subscribe("msh/#", QoS::AtMostOnce).await.unwrap();
        assert_eq!(link.subscriptions(), vec!["msh/#"]);

        let topic = MeshEnvelope::topic("EU_868", "!gw000001");
        let text = TelemetryBuilder::new("m1").load(40.0).to_text();
        let envelope = serde_json::to_vec(&MeshEnvelope::text(7, &text)).unwrap();
        link.publish(topic.clone(), QoS::AtMostOnce, envelope).await.unwrap();

        assert_eq!(link.published().len(), 1);
        assert_eq!(link.last_text(&topic).unwrap().as_deref(), Some(text.as_str()));
        link.clear();
        assert!(link.published().is_empty());
    }

    #[tokio::test]
    async fn simulated_packets_reach_the_receiver() {
        let link = MockMeshLink::new();
        assert!(link.simulate_incoming("t", b"x".to_vec()).is_err());

        let mut rx = link.setup_receiver();
        link.simulate_text("msh/test", 42, r#"{"machineId":"m1"}"#).unwrap();
        let packet = rx.recv().await.unwrap();
        let envelope: Value = serde_json::from_slice(&packet.payload).unwrap();
        assert_eq!(envelope["type"], "text");
        assert_eq!(envelope["from"], 42);
        assert_eq!(envelope["sender"], "!0000002a");
    }

    #[test]
    fn position_envelope_has_no_text() {
        let envelope = MeshEnvelope::position(1, 515000000, -1200000);
        assert_eq!(envelope["type"], "position");
        assert!(envelope["payload"]["text"].is_null());
    }
}
