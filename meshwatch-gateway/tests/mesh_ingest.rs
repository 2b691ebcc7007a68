mod common;

use std::time::Duration;

use common::{next_text, next_text_within, TestServer};
use meshwatch_devkit::{FrameRecorder, MeshEnvelope, MockMeshLink, TelemetryBuilder};
use meshwatch_gateway::config::GatewayConfig;
use meshwatch_gateway::models::MachineStatus;
use meshwatch_gateway::mqtt::handle_publish;
use meshwatch_gateway::staleness::spawn_staleness_monitor;
use meshwatch_gateway::Gateway;

const TOPIC: &str = "msh/EU_868/2/json/LongFast/!gw000001";

#[tokio::test]
async fn envelopes_from_the_mesh_reach_the_state() {
    let (gateway, _broadcaster) = Gateway::new(GatewayConfig::default()).unwrap();
    let link = MockMeshLink::new();
    let mut rx = link.setup_receiver();

    let hot = TelemetryBuilder::new("kiln-3").name("Kiln 3").temperature(82.0).to_text();
    link.simulate_text(TOPIC, 11, &hot).unwrap();
    let position = serde_json::to_vec(&MeshEnvelope::position(11, 1, 2)).unwrap();
    link.simulate_incoming(TOPIC, position).unwrap();
    link.simulate_incoming(TOPIC, TelemetryBuilder::new("raw-1").load(20.0).to_bytes()).unwrap();

    for _ in 0..3 {
        let packet = rx.recv().await.unwrap();
        handle_publish(&gateway.ingestor, &packet.topic, &packet.payload);
    }

    let state = gateway.state.lock();
    let ids: Vec<_> = state.machines().keys().cloned().collect();
    assert_eq!(ids, ["kiln-3", "raw-1"]);
    let kiln = state.machine("kiln-3").unwrap();
    assert_eq!(kiln.status, MachineStatus::Critical);
    assert_eq!(kiln.name, "Kiln 3");
    assert_eq!(state.alerts().len(), 1);

    let health = gateway.health.get_health(&gateway.state, &gateway.registry);
    assert_eq!(health.payloads_ingested, 2);
    assert_eq!(health.payloads_dropped, 0);
}

#[tokio::test]
async fn offline_event_keeps_metrics_and_raises_high_alert() {
    let (gateway, _broadcaster) = Gateway::new(GatewayConfig::default()).unwrap();
    let link = MockMeshLink::new();
    let mut rx = link.setup_receiver();

    link.simulate_text(TOPIC, 5, &TelemetryBuilder::new("m1").temperature(40.0).load(10.0).to_text()).unwrap();
    link.simulate_text(TOPIC, 5, &TelemetryBuilder::new("m1").offline().to_text()).unwrap();
    for _ in 0..2 {
        let packet = rx.recv().await.unwrap();
        handle_publish(&gateway.ingestor, &packet.topic, &packet.payload);
    }

    let state = gateway.state.lock();
    let m1 = state.machine("m1").unwrap();
    assert_eq!(m1.status, MachineStatus::Offline);
    assert_eq!(m1.temperature, 40.0);
    let alert = state.alerts().iter().last().unwrap();
    assert_eq!(alert.machine_id, "m1");
    assert_eq!(serde_json::to_value(alert.severity).unwrap(), "high");
}

#[tokio::test]
async fn silent_machines_expire_when_enabled() {
    let mut config = GatewayConfig::default();
    config.staleness.offline_after_secs = Some(1);
    config.staleness.check_interval_secs = 1;
    let server = TestServer::start_with(config).await;
    server.ingest(&TelemetryBuilder::new("quiet").load(30.0).to_bytes());

    let mut ws = server.connect().await;
    let mut rec = FrameRecorder::new();
    rec.record(&next_text(&mut ws).await).unwrap();
    rec.assert_status("quiet", "ok").unwrap();

    let monitor = spawn_staleness_monitor(&server.gateway.config.staleness, server.gateway.ingestor.clone())
        .expect("monitor enabled");

    let mut expired = false;
    for _ in 0..5 {
        rec.record(&next_text_within(&mut ws, Duration::from_secs(4)).await).unwrap();
        if rec.assert_status("quiet", "offline").is_ok() {
            expired = true;
            break;
        }
    }
    assert!(expired, "machine never marked offline");
    monitor.abort();
    server.shutdown().await;
}
