use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::OffsetDateTime;

/// Placeholder used for creation metadata the first payload did not carry.
pub const PLACEHOLDER: &str = "N/A";
/// Every machine reaches the gateway through the mesh radio.
pub const MESH_CHANNEL: &str = "Mesh";

pub type AlertId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Ok,
    Warning,
    Critical,
    Offline,
}

impl MachineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineStatus::Ok => "ok",
            MachineStatus::Warning => "warning",
            MachineStatus::Critical => "critical",
            MachineStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Latest known state of one monitored machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub location: String,
    pub temperature: f64,
    pub vibration: f64,
    pub load: f64,
    pub status: MachineStatus,
    pub channel: String,
    pub last_update: String,
    /// Wall-clock instant of the last payload, used by the staleness monitor.
    #[serde(skip)]
    pub last_seen: OffsetDateTime,
}

impl Machine {
    /// Record for a machine seen for the first time. Metrics start at zero
    /// and the name is the id until a metric payload carries one.
    pub fn create(id: &str, payload: &TelemetryIn, now: OffsetDateTime) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            machine_type: payload.machine_type.clone().unwrap_or_else(|| PLACEHOLDER.into()),
            location: payload.location.clone().unwrap_or_else(|| PLACEHOLDER.into()),
            temperature: 0.0,
            vibration: 0.0,
            load: 0.0,
            status: MachineStatus::Ok,
            channel: MESH_CHANNEL.into(),
            last_update: format_stamp(now),
            last_seen: now,
        }
    }

    /// Copies the recognized fields present in `payload`; absent ones are kept.
    pub fn merge(&mut self, payload: &TelemetryIn) {
        if let Some(v) = payload.temperature { self.temperature = v; }
        if let Some(v) = payload.vibration { self.vibration = v; }
        if let Some(v) = payload.load { self.load = v; }
        if let Some(v) = &payload.name { self.name = v.clone(); }
        if let Some(v) = &payload.machine_type { self.machine_type = v.clone(); }
        if let Some(v) = &payload.location { self.location = v.clone(); }
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_update = format_stamp(now);
        self.last_seen = now;
    }
}

/// Immutable alert entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub machine_id: String,
    pub severity: Severity,
    pub description: String,
    pub timestamp: String,
}

/// Decoded telemetry text as sent by a machine over the mesh.
///
/// Every field is lenient: a value of the wrong shape reads as absent instead
/// of rejecting the whole payload.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryIn {
    #[serde(default, deserialize_with = "lenient_id")]
    pub machine_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub event: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub vibration: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub load: Option<f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient_text")]
    pub machine_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub location: Option<String>,
}

impl TelemetryIn {
    pub fn is_offline_event(&self) -> bool {
        self.event.as_deref() == Some("offline")
    }
}

fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Snapshot,
    Update,
}

/// Wire shape of the snapshot and update frames pushed to subscribers.
#[derive(Debug, Serialize)]
pub struct StateFrame<'a> {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub machines: Vec<&'a Machine>,
    pub alerts: Vec<&'a Alert>,
}

/// `YYYY-MM-DD HH:MM:SS`, UTC.
pub fn format_stamp(at: OffsetDateTime) -> String {
    at.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_default()
}
