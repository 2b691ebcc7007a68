use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::models::{format_stamp, Alert, AlertId, Severity};

pub const DEFAULT_CAPACITY: usize = 200;

/// Bounded, ordered alert store. Oldest entries are evicted first.
#[derive(Debug)]
pub struct AlertLog {
    entries: VecDeque<Alert>,
    capacity: usize,
    last_id: AlertId,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
            last_id: 0,
        }
    }

    /// Appends an alert stamped with the current time.
    pub fn add(&mut self, machine_id: &str, severity: Severity, description: &str) -> AlertId {
        self.add_at(machine_id, severity, description, OffsetDateTime::now_utc())
    }

    pub fn add_at(
        &mut self,
        machine_id: &str,
        severity: Severity,
        description: &str,
        now: OffsetDateTime,
    ) -> AlertId {
        // millisecond clock, bumped so two alerts in the same ms never share an id
        let millis = (now.unix_timestamp_nanos() / 1_000_000) as AlertId;
        let id = millis.max(self.last_id + 1);
        self.last_id = id;

        self.entries.push_back(Alert {
            id,
            machine_id: machine_id.to_string(),
            severity,
            description: description.to_string(),
            timestamp: format_stamp(now),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        id
    }

    /// The `n` most recent alerts, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &Alert> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alert> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// What an alert is about, used to key the debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Offline,
    Temperature,
    Vibration,
}

/// Optional per machine + kind suppression window. Without a window every
/// alert goes through, which is the default.
#[derive(Debug, Default)]
pub struct AlertDebounce {
    window: Option<Duration>,
    last_alert: HashMap<(String, AlertKind), Instant>,
}

impl AlertDebounce {
    pub fn new(window: Option<Duration>) -> Self {
        Self { window, last_alert: HashMap::new() }
    }

    /// Returns `true` if the alert may be emitted, and records it if so.
    pub fn allow(&mut self, machine_id: &str, kind: AlertKind, now: Instant) -> bool {
        let Some(window) = self.window else { return true };
        let key = (machine_id.to_string(), kind);
        if let Some(last) = self.last_alert.get(&key) {
            if now.saturating_duration_since(*last) < window {
                return false;
            }
        }
        self.last_alert.retain(|_, last| now.saturating_duration_since(*last) < window);
        self.last_alert.insert(key, now);
        true
    }
}
