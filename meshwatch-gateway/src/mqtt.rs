use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::Value;
use tokio::task::{self, JoinHandle};

use crate::config::MeshConf;
use crate::health::HealthTracker;
use crate::ingest::{IngestReport, TelemetryIngestor};

/// Text carried by one MQTT publish from the mesh bridge.
///
/// The radio's JSON bridge wraps each decoded packet in an envelope
/// (`{"from":..,"type":"text","payload":{"text":".."}}`). Text envelopes are
/// unwrapped; envelopes of any other type (position, nodeinfo, telemetry)
/// yield `None`. Payloads that are not envelopes, including any object that
/// carries a `machineId`, are taken as raw text.
pub fn decoded_text(payload: &[u8]) -> Option<Cow<'_, [u8]>> {
    let Ok(Value::Object(envelope)) = serde_json::from_slice::<Value>(payload) else {
        return Some(Cow::Borrowed(payload));
    };
    let is_envelope = !envelope.contains_key("machineId")
        && envelope.contains_key("from")
        && envelope.contains_key("payload")
        && envelope.get("type").is_some_and(Value::is_string);
    if !is_envelope {
        return Some(Cow::Borrowed(payload));
    }
    if envelope.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    envelope
        .get("payload")
        .and_then(|p| p.get("text"))
        .and_then(Value::as_str)
        .map(|text| Cow::Owned(text.as_bytes().to_vec()))
}

/// Routes one publish into the ingestor.
pub fn handle_publish(ingestor: &TelemetryIngestor, topic: &str, payload: &[u8]) -> Option<IngestReport> {
    let Some(text) = decoded_text(payload) else {
        tracing::trace!(topic, "non-text mesh packet ignored");
        return None;
    };
    ingestor.ingest(&text)
}

fn mqtt_options(cfg: &MeshConf) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.broker_host, cfg.broker_port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    opts
}

/// Spawns the mesh listener. Broker failures are logged and retried forever;
/// the gateway keeps serving subscribers with whatever state it already has.
pub fn spawn_mesh_listener(
    cfg: MeshConf,
    ingestor: Arc<TelemetryIngestor>,
    health: HealthTracker,
) -> JoinHandle<()> {
    task::spawn(async move {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&cfg), 10);
        tracing::info!(broker = %cfg.broker_host, port = cfg.broker_port, topic = %cfg.topic, "connecting to mesh bridge");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mesh_connected();
                    tracing::info!(topic = %cfg.topic, "mesh bridge connected");
                    // clean session: subscriptions are lost on every reconnect
                    if let Err(e) = client.try_subscribe(&cfg.topic, QoS::AtMostOnce) {
                        tracing::error!(error = %e, "mesh subscribe failed");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    if let Some(report) = handle_publish(&ingestor, &p.topic, &p.payload) {
                        tracing::debug!(
                            topic = %p.topic,
                            machine_id = %report.machine_id,
                            status = report.status.as_str(),
                            alerts = report.alerts.len(),
                            "telemetry ingested"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    health.mark_mesh_disconnected();
                    tracing::warn!(error = %e, "mesh bridge unreachable, retrying");
                    tokio::time::sleep(Duration::from_secs(cfg.retry_delay_secs.max(1))).await;
                }
            }
        }
    })
}
