/**
 * TELEMETRY INGESTOR - Merges decoded mesh payloads into machine state
 *
 * ROLE: validate payload → look up / create the machine → offline path or
 * metric merge → status recompute → threshold alerts → hand the new state to
 * the broadcaster when someone is listening.
 *
 * Malformed input is absorbed here: radio links are lossy and untrusted, so a
 * bad payload is logged at debug level and counted, never returned upstream.
 */

use std::time::{Duration, Instant};

use serde_json::Value;
use time::OffsetDateTime;

use crate::alerts::AlertKind;
use crate::broadcast::Publisher;
use crate::error::IngestError;
use crate::health::HealthTracker;
use crate::models::{format_stamp, AlertId, FrameKind, Machine, MachineStatus, Severity, TelemetryIn};
use crate::state::{GatewayState, Shared};
use crate::status::{evaluate, Thresholds};

const OFFLINE_ALERT: &str = "Machine unresponsive (no communication)";
const TEMPERATURE_HIGH: &str = "Temperature critically high";
const TEMPERATURE_MEDIUM: &str = "Temperature above recommended level";
const VIBRATION_HIGH: &str = "Severe structural vibration detected";
const VIBRATION_MEDIUM: &str = "Vibration above normal threshold";

/// What one accepted payload did to the state.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub machine_id: String,
    pub status: MachineStatus,
    pub created: bool,
    pub alerts: Vec<AlertId>,
    pub published: bool,
}

pub struct TelemetryIngestor {
    state: Shared<GatewayState>,
    thresholds: Thresholds,
    snapshot_limit: usize,
    publisher: Publisher,
    health: HealthTracker,
}

/// Parses raw payload bytes into the recognized telemetry fields.
pub fn parse_payload(raw: &[u8]) -> Result<TelemetryIn, IngestError> {
    let value: Value = serde_json::from_slice(raw)?;
    if !value.is_object() {
        return Err(IngestError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

impl TelemetryIngestor {
    pub fn new(
        state: Shared<GatewayState>,
        thresholds: Thresholds,
        snapshot_limit: usize,
        publisher: Publisher,
        health: HealthTracker,
    ) -> Self {
        Self { state, thresholds, snapshot_limit, publisher, health }
    }

    pub fn state(&self) -> &Shared<GatewayState> {
        &self.state
    }

    /// Ingests one decoded payload. Dropped payloads return `None`.
    pub fn ingest(&self, raw: &[u8]) -> Option<IngestReport> {
        match self.try_ingest(raw) {
            Ok(report) => {
                self.health.record_ingested();
                Some(report)
            }
            Err(e) => {
                self.health.record_dropped();
                tracing::debug!(error = %e, "telemetry payload dropped");
                None
            }
        }
    }

    fn try_ingest(&self, raw: &[u8]) -> Result<IngestReport, IngestError> {
        let payload = parse_payload(raw)?;
        let machine_id = payload.machine_id.clone().ok_or(IngestError::MissingMachineId)?;
        let now = OffsetDateTime::now_utc();
        let tick = Instant::now();

        let mut state = self.state.lock();
        let created = !state.machines().contains_key(&machine_id);
        if created {
            let machine = Machine::create(&machine_id, &payload, now);
            state.machines_mut().insert(machine_id.clone(), machine);
            tracing::info!(machine_id = %machine_id, "new machine on the mesh");
        }

        let (status, alerts) = if payload.is_offline_event() {
            let alerts = mark_offline(&mut state, &machine_id, now, tick).into_iter().collect();
            tracing::warn!(machine_id = %machine_id, "machine reported offline");
            (MachineStatus::Offline, alerts)
        } else {
            self.apply_metrics(&mut state, &machine_id, &payload, now, tick)
        };

        // publish before unlocking so frames reach the handoff in mutation order
        let published = self.update_frame(&state).is_some_and(|f| self.publisher.publish(f));
        drop(state);
        Ok(IngestReport { machine_id, status, created, alerts, published })
    }

    fn apply_metrics(
        &self,
        state: &mut GatewayState,
        machine_id: &str,
        payload: &TelemetryIn,
        now: OffsetDateTime,
        tick: Instant,
    ) -> (MachineStatus, Vec<AlertId>) {
        let Some(machine) = state.machines_mut().get_mut(machine_id) else {
            return (MachineStatus::Ok, Vec::new());
        };
        let previous = machine.status;
        machine.merge(payload);
        machine.touch(now);
        machine.status = evaluate(
            &self.thresholds,
            false,
            machine.temperature,
            machine.vibration,
            machine.load,
        );
        let (status, temperature, vibration, load) =
            (machine.status, machine.temperature, machine.vibration, machine.load);

        if status != previous && matches!(status, MachineStatus::Warning | MachineStatus::Critical) {
            tracing::warn!(
                machine_id,
                status = status.as_str(),
                temperature,
                vibration,
                load,
                "machine health degraded"
            );
        }

        let mut alerts = Vec::new();
        if let Some(severity) = self.thresholds.temperature.severity(temperature) {
            let description = if severity == Severity::High { TEMPERATURE_HIGH } else { TEMPERATURE_MEDIUM };
            alerts.extend(state.raise_alert(machine_id, AlertKind::Temperature, severity, description, tick));
        }
        if let Some(severity) = self.thresholds.vibration.severity(vibration) {
            let description = if severity == Severity::High { VIBRATION_HIGH } else { VIBRATION_MEDIUM };
            alerts.extend(state.raise_alert(machine_id, AlertKind::Vibration, severity, description, tick));
        }
        (status, alerts)
    }

    /// Builds an update frame, or `None` when nobody is subscribed.
    fn update_frame(&self, state: &GatewayState) -> Option<String> {
        if !self.publisher.has_subscribers() {
            return None;
        }
        match state.frame(FrameKind::Update, self.snapshot_limit) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(error = %e, "cannot encode update frame");
                None
            }
        }
    }

    /// Treats machines silent for longer than `max_silence` as offline.
    ///
    /// Machines already offline are left alone, so each silence raises one
    /// alert. Returns the ids that changed.
    pub fn expire_silent(&self, max_silence: Duration, now: OffsetDateTime) -> Vec<String> {
        let tick = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .machines()
            .values()
            .filter(|m| m.status != MachineStatus::Offline)
            .filter(|m| (now - m.last_seen) > max_silence)
            .map(|m| m.id.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }
        for id in &expired {
            mark_offline(&mut state, id, now, tick);
            tracing::warn!(machine_id = %id, silent_secs = max_silence.as_secs(), "machine went silent, marked offline");
        }
        if let Some(frame) = self.update_frame(&state) {
            self.publisher.publish(frame);
        }
        expired
    }
}

/// Offline path: status forced to offline, metrics untouched, one high alert.
fn mark_offline(
    state: &mut GatewayState,
    machine_id: &str,
    now: OffsetDateTime,
    tick: Instant,
) -> Option<AlertId> {
    let machine = state.machines_mut().get_mut(machine_id)?;
    machine.status = MachineStatus::Offline;
    machine.last_update = format_stamp(now);
    state.raise_alert(machine_id, AlertKind::Offline, Severity::High, OFFLINE_ALERT, tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertDebounce, AlertLog};
    use crate::broadcast::{handoff, Broadcaster, SubscriberRegistry};
    use crate::state::new_state;

    struct Fixture {
        ingestor: TelemetryIngestor,
        registry: SubscriberRegistry,
        _broadcaster: Broadcaster,
    }

    fn fixture_with(state: GatewayState) -> Fixture {
        let registry = SubscriberRegistry::new(16);
        let health = HealthTracker::new();
        let (publisher, broadcaster) = handoff(16, registry.clone(), health.clone());
        let ingestor = TelemetryIngestor::new(new_state(state), Thresholds::default(), 50, publisher, health);
        Fixture { ingestor, registry, _broadcaster: broadcaster }
    }

    fn fixture() -> Fixture {
        fixture_with(GatewayState::default())
    }

    fn machine(f: &Fixture, id: &str) -> Machine {
        f.ingestor.state().lock().machine(id).cloned().unwrap()
    }

    #[test]
    fn hot_machine_is_critical_with_one_temperature_alert() {
        let f = fixture();
        let report = f.ingestor.ingest(br#"{"machineId":"m1","temperature":85}"#).unwrap();
        assert_eq!(report.status, MachineStatus::Critical);
        assert_eq!(report.alerts.len(), 1);

        let state = f.ingestor.state().lock();
        let alerts: Vec<_> = state.alerts().iter().collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::High);
        assert!(alerts[0].description.contains("Temperature"));
        assert_eq!(alerts[0].machine_id, "m1");
    }

    #[test]
    fn vibrating_machine_is_warning_with_medium_alert() {
        let f = fixture();
        let report = f.ingestor.ingest(br#"{"machineId":"m2","vibration":8}"#).unwrap();
        assert_eq!(report.status, MachineStatus::Warning);
        let state = f.ingestor.state().lock();
        let alert = state.alerts().iter().next().unwrap();
        assert_eq!(alert.severity, Severity::Medium);
        assert!(alert.description.contains("Vibration"));
        assert_eq!(state.alerts().len(), 1);
    }

    #[test]
    fn one_cycle_can_raise_two_alerts() {
        let f = fixture();
        let report = f.ingestor.ingest(br#"{"machineId":"m3","temperature":75,"vibration":12}"#).unwrap();
        assert_eq!(report.status, MachineStatus::Critical);
        let state = f.ingestor.state().lock();
        let severities: Vec<Severity> = state.alerts().iter().map(|a| a.severity).collect();
        assert_eq!(severities, [Severity::Medium, Severity::High]);
    }

    #[test]
    fn load_changes_status_but_never_alerts() {
        let f = fixture();
        let report = f.ingestor.ingest(br#"{"machineId":"m4","load":97}"#).unwrap();
        assert_eq!(report.status, MachineStatus::Critical);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn first_payload_creates_record_with_defaults() {
        let f = fixture();
        let report = f.ingestor.ingest(br#"{"machineId":"press-1","name":"Press","location":"Hall B","load":10}"#).unwrap();
        assert!(report.created);
        let m = machine(&f, "press-1");
        assert_eq!(m.name, "Press");
        assert_eq!(m.machine_type, "N/A");
        assert_eq!(m.location, "Hall B");
        assert_eq!((m.temperature, m.vibration, m.load), (0.0, 0.0, 10.0));
        assert_eq!(m.status, MachineStatus::Ok);
    }

    #[test]
    fn status_in_payload_is_not_copied() {
        let f = fixture();
        f.ingestor.ingest(br#"{"machineId":"m1","status":"critical","channel":"LoRa"}"#).unwrap();
        let m = machine(&f, "m1");
        assert_eq!(m.status, MachineStatus::Ok);
        assert_eq!(m.channel, "Mesh");
    }

    #[test]
    fn partial_payload_keeps_unspecified_fields() {
        let f = fixture();
        f.ingestor.ingest(br#"{"machineId":"m1","temperature":60,"vibration":3,"load":40,"type":"Mill"}"#).unwrap();
        f.ingestor.ingest(br#"{"machineId":"m1","load":50}"#).unwrap();
        let m = machine(&f, "m1");
        assert_eq!((m.temperature, m.vibration, m.load), (60.0, 3.0, 50.0));
        assert_eq!(m.machine_type, "Mill");
    }

    #[test]
    fn payloads_without_id_or_not_json_change_nothing() {
        let f = fixture();
        f.ingestor.ingest(br#"{"machineId":"m1","temperature":85}"#).unwrap();
        let before_machines = f.ingestor.state().lock().machines().clone();
        let before_alerts: Vec<_> = f.ingestor.state().lock().alerts().iter().cloned().collect();

        let rejected: [&[u8]; 6] = [
            br#"{"temperature":99,"vibration":20}"#,
            br#"{"machineId":"","temperature":99}"#,
            br#"{"machineId":null,"event":"offline"}"#,
            b"not json at all",
            b"[1,2,3]",
            b"\xff\xfe",
        ];
        for raw in rejected {
            assert!(f.ingestor.ingest(raw).is_none());
        }

        let state = f.ingestor.state().lock();
        assert_eq!(state.machines(), &before_machines);
        assert_eq!(state.alerts().iter().cloned().collect::<Vec<_>>(), before_alerts);
    }

    #[test]
    fn offline_event_keeps_metrics_and_raises_one_alert() {
        let f = fixture();
        f.ingestor.ingest(br#"{"machineId":"m1","temperature":65,"vibration":2,"load":30}"#).unwrap();
        let report = f.ingestor.ingest(br#"{"machineId":"m1","event":"offline","temperature":99}"#).unwrap();
        assert_eq!(report.status, MachineStatus::Offline);
        assert_eq!(report.alerts.len(), 1);

        let m = machine(&f, "m1");
        assert_eq!(m.status, MachineStatus::Offline);
        assert_eq!((m.temperature, m.vibration, m.load), (65.0, 2.0, 30.0));
        let state = f.ingestor.state().lock();
        assert_eq!(state.alerts().len(), 1);
        assert_eq!(state.alerts().iter().next().unwrap().severity, Severity::High);
    }

    #[test]
    fn offline_event_for_unknown_machine_creates_it() {
        let f = fixture();
        let report = f.ingestor.ingest(br#"{"machineId":"ghost","event":"offline","type":"Pump","name":"Ghost"}"#).unwrap();
        assert!(report.created);
        let m = machine(&f, "ghost");
        assert_eq!(m.status, MachineStatus::Offline);
        assert_eq!(m.name, "ghost");
        assert_eq!(m.machine_type, "Pump");
        assert_eq!(m.temperature, 0.0);
    }

    #[test]
    fn next_metric_payload_brings_machine_back() {
        let f = fixture();
        f.ingestor.ingest(br#"{"machineId":"m1","event":"offline"}"#).unwrap();
        let report = f.ingestor.ingest(br#"{"machineId":"m1","temperature":20}"#).unwrap();
        assert_eq!(report.status, MachineStatus::Ok);
    }

    #[test]
    fn repeated_breaches_are_not_deduplicated() {
        let f = fixture();
        f.ingestor.ingest(br#"{"machineId":"m1","temperature":85}"#).unwrap();
        f.ingestor.ingest(br#"{"machineId":"m1","temperature":85}"#).unwrap();
        assert_eq!(f.ingestor.state().lock().alerts().len(), 2);
    }

    #[test]
    fn debounce_window_suppresses_repeats_when_enabled() {
        let state = GatewayState::new(AlertLog::default(), AlertDebounce::new(Some(Duration::from_secs(300))));
        let f = fixture_with(state);
        f.ingestor.ingest(br#"{"machineId":"m1","temperature":85}"#).unwrap();
        let second = f.ingestor.ingest(br#"{"machineId":"m1","temperature":85}"#).unwrap();
        assert!(second.alerts.is_empty());
        assert_eq!(second.status, MachineStatus::Critical);
        assert_eq!(f.ingestor.state().lock().alerts().len(), 1);
    }

    #[test]
    fn alert_log_stays_bounded() {
        let f = fixture();
        let mut ids = Vec::new();
        for i in 0..230 {
            let raw = format!(r#"{{"machineId":"m{}","temperature":85}}"#, i % 7);
            ids.extend(f.ingestor.ingest(raw.as_bytes()).unwrap().alerts);
        }
        let state = f.ingestor.state().lock();
        assert_eq!(state.alerts().len(), 200);
        let kept: Vec<AlertId> = state.alerts().iter().map(|a| a.id).collect();
        assert_eq!(kept, ids[30..].to_vec());
    }

    #[test]
    fn publish_is_skipped_without_subscribers() {
        let f = fixture();
        let report = f.ingestor.ingest(br#"{"machineId":"m1","temperature":20}"#).unwrap();
        assert!(!report.published);

        let (_id, _rx) = f.registry.register("snap".into());
        let report = f.ingestor.ingest(br#"{"machineId":"m1","temperature":21}"#).unwrap();
        assert!(report.published);
    }

    #[test]
    fn silent_machines_expire_once() {
        let f = fixture();
        f.ingestor.ingest(br#"{"machineId":"m1","temperature":20}"#).unwrap();
        f.ingestor.ingest(br#"{"machineId":"m2","temperature":20}"#).unwrap();
        f.ingestor.state().lock().machines_mut().get_mut("m1").unwrap().last_seen -= Duration::from_secs(600);

        let now = OffsetDateTime::now_utc();
        assert_eq!(f.ingestor.expire_silent(Duration::from_secs(120), now), ["m1"]);
        assert!(f.ingestor.expire_silent(Duration::from_secs(120), now).is_empty());

        assert_eq!(machine(&f, "m1").status, MachineStatus::Offline);
        assert_eq!(machine(&f, "m2").status, MachineStatus::Ok);
        assert_eq!(f.ingestor.state().lock().alerts().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_ingestion_delivers_frames_in_mutation_order() {
        use axum::extract::ws::Message;
        use std::collections::HashMap;
        use std::sync::Arc;

        let registry = SubscriberRegistry::new(8192);
        let health = HealthTracker::new();
        let (publisher, broadcaster) = handoff(8192, registry.clone(), health.clone());
        let ingestor = Arc::new(TelemetryIngestor::new(
            new_state(GatewayState::default()),
            Thresholds::default(),
            0,
            publisher,
            health,
        ));
        let (_id, mut rx) = registry.register("snap".into());
        let task = broadcaster.spawn();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let ingestor = ingestor.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let raw = format!(r#"{{"machineId":"m{w}","load":{i}}}"#);
                        ingestor.ingest(raw.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        // last publisher gone: the broadcaster drains and exits
        drop(ingestor);
        task.await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), Message::Text(t) if t.as_str() == "snap"));
        let mut last_load: HashMap<String, f64> = HashMap::new();
        let mut frames = 0;
        while let Ok(Message::Text(text)) = rx.try_recv() {
            frames += 1;
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            for m in frame["machines"].as_array().unwrap() {
                let id = m["id"].as_str().unwrap().to_string();
                let load = m["load"].as_f64().unwrap();
                let prev = last_load.insert(id.clone(), load).unwrap_or(0.0);
                assert!(load >= prev, "{id}: load went back from {prev} to {load} in frame {frames}");
            }
        }
        assert_eq!(frames, 2000);
    }
}
