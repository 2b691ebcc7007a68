use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::alerts::{AlertDebounce, AlertKind, AlertLog};
use crate::error::GatewayError;
use crate::models::{Alert, AlertId, FrameKind, Machine, Severity, StateFrame};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Machines keyed by id, in first-seen order.
pub type MachinesMap = IndexMap<String, Machine>;

/// Owner of everything the gateway knows: machine records and the alert log.
#[derive(Debug, Default)]
pub struct GatewayState {
    machines: MachinesMap,
    alerts: AlertLog,
    debounce: AlertDebounce,
}

impl GatewayState {
    pub fn new(alerts: AlertLog, debounce: AlertDebounce) -> Self {
        Self { machines: IndexMap::new(), alerts, debounce }
    }

    pub fn machines(&self) -> &MachinesMap {
        &self.machines
    }

    pub fn machines_mut(&mut self) -> &mut MachinesMap {
        &mut self.machines
    }

    pub fn machine(&self, id: &str) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    /// Adds an alert unless the debounce window swallows it.
    pub fn raise_alert(
        &mut self,
        machine_id: &str,
        kind: AlertKind,
        severity: Severity,
        description: &str,
        now: Instant,
    ) -> Option<AlertId> {
        if !self.debounce.allow(machine_id, kind, now) {
            tracing::debug!(machine_id, ?kind, "alert suppressed by debounce window");
            return None;
        }
        Some(self.alerts.add(machine_id, severity, description))
    }

    /// Serialized snapshot/update frame: every machine plus the last `alert_limit` alerts.
    pub fn frame(&self, kind: FrameKind, alert_limit: usize) -> Result<String, GatewayError> {
        let frame = StateFrame {
            kind,
            machines: self.machines.values().collect(),
            alerts: self.alerts.recent(alert_limit).collect::<Vec<&Alert>>(),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}
