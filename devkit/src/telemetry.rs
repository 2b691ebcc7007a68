/*!
Telemetry payload builders

Builds the JSON text a machine sends over the mesh. Only the fields that were
set end up in the payload, so tests can exercise partial updates.
*/

use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct TelemetryBuilder {
    fields: Map<String, Value>,
}

impl TelemetryBuilder {
    pub fn new<S: Into<String>>(machine_id: S) -> Self {
        let mut fields = Map::new();
        fields.insert("machineId".into(), Value::String(machine_id.into()));
        Self { fields }
    }

    /// Payload without a machine id, which the gateway must drop.
    pub fn anonymous() -> Self {
        Self { fields: Map::new() }
    }

    pub fn temperature(self, value: f64) -> Self {
        self.field("temperature", value)
    }

    pub fn vibration(self, value: f64) -> Self {
        self.field("vibration", value)
    }

    pub fn load(self, value: f64) -> Self {
        self.field("load", value)
    }

    pub fn name<S: Into<String>>(self, name: S) -> Self {
        self.field("name", name.into())
    }

    pub fn machine_type<S: Into<String>>(self, machine_type: S) -> Self {
        self.field("type", machine_type.into())
    }

    pub fn location<S: Into<String>>(self, location: S) -> Self {
        self.field("location", location.into())
    }

    /// Marks the payload as an offline event.
    pub fn offline(self) -> Self {
        self.field("event", "offline")
    }

    /// Sets any field verbatim, including wrong shapes.
    pub fn field<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn build(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn to_text(&self) -> String {
        self.build().to_string()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_text().into_bytes()
    }
}

/// Payloads the gateway must drop without touching its state.
pub mod malformed {
    pub const NOT_JSON: &[u8] = b"temp=85;load=12";
    pub const TRUNCATED: &[u8] = br#"{"machineId":"m1","temperature":8"#;
    pub const ARRAY: &[u8] = br#"[{"machineId":"m1"}]"#;
    pub const EMPTY_ID: &[u8] = br#"{"machineId":"","temperature":90}"#;

    pub fn all() -> [&'static [u8]; 4] {
        [NOT_JSON, TRUNCATED, ARRAY, EMPTY_ID]
    }
}
