//! Health status derivation from machine metrics.
//!
//! The same `Thresholds` value drives both the status shown for a machine and
//! the alerts raised for it, so the two can never disagree on a boundary.

use serde::{Deserialize, Serialize};

use crate::models::{MachineStatus, Severity};

/// Warning and critical boundaries for one metric. Both are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl MetricThresholds {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    /// Alert severity for `value`, `None` while in the normal range.
    pub fn severity(&self, value: f64) -> Option<Severity> {
        if value > self.critical {
            Some(Severity::High)
        } else if value > self.warning {
            Some(Severity::Medium)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub temperature: MetricThresholds,
    pub vibration: MetricThresholds,
    pub load: MetricThresholds,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature: MetricThresholds::new(70.0, 80.0),
            vibration: MetricThresholds::new(7.0, 10.0),
            load: MetricThresholds::new(85.0, 95.0),
        }
    }
}

impl Thresholds {
    /// Every boundary must be finite and warning must not exceed critical.
    pub fn validate(&self) -> Result<(), String> {
        for (name, t) in [
            ("temperature", &self.temperature),
            ("vibration", &self.vibration),
            ("load", &self.load),
        ] {
            if !t.warning.is_finite() || !t.critical.is_finite() {
                return Err(format!("{name} thresholds must be finite"));
            }
            if t.warning > t.critical {
                return Err(format!(
                    "{name} warning ({}) is above critical ({})",
                    t.warning, t.critical
                ));
            }
        }
        Ok(())
    }
}

/// Offline wins over everything, then critical, then warning.
pub fn evaluate(
    thresholds: &Thresholds,
    offline: bool,
    temperature: f64,
    vibration: f64,
    load: f64,
) -> MachineStatus {
    if offline {
        return MachineStatus::Offline;
    }
    let t = thresholds;
    if temperature > t.temperature.critical || load > t.load.critical || vibration > t.vibration.critical {
        MachineStatus::Critical
    } else if temperature > t.temperature.warning || load > t.load.warning || vibration > t.vibration.warning {
        MachineStatus::Warning
    } else {
        MachineStatus::Ok
    }
}
