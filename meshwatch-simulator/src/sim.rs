use rand::Rng;
use serde::Serialize;

/// Telemetry text one simulated machine sends over the mesh.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub machine_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Odds {
    pub spike: f64,
    pub offline: f64,
    pub recover: f64,
}

impl Default for Odds {
    fn default() -> Self {
        Self { spike: 0.03, offline: 0.01, recover: 0.3 }
    }
}

/// Random walk around nominal values for one machine.
#[derive(Debug, Clone)]
pub struct SimMachine {
    pub id: String,
    name: String,
    machine_type: String,
    location: String,
    nominal: [f64; 3],
    current: [f64; 3],
    offline: bool,
    introduced: bool,
}

impl SimMachine {
    pub fn new(id: &str, name: &str, machine_type: &str, location: &str, nominal: [f64; 3]) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            machine_type: machine_type.into(),
            location: location.into(),
            nominal,
            current: nominal,
            offline: false,
            introduced: false,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Next reading, or `None` while the machine stays silent.
    ///
    /// The first reading carries the machine's metadata; later ones only the
    /// metrics. Going offline emits one offline event, then silence until the
    /// machine recovers.
    pub fn step<R: Rng>(&mut self, rng: &mut R, odds: Odds) -> Option<Reading> {
        if self.offline {
            if !rng.random_bool(odds.recover) {
                return None;
            }
            self.offline = false;
            self.current = self.nominal;
        } else if self.introduced && rng.random_bool(odds.offline) {
            self.offline = true;
            return Some(self.reading(Some("offline")));
        }

        for (value, nominal) in self.current.iter_mut().zip(self.nominal) {
            let drift = rng.random_range(-0.05..0.05) * nominal;
            // pull back towards nominal so the walk stays bounded
            *value = (*value + drift + (nominal - *value) * 0.2).max(0.0);
        }
        if rng.random_bool(odds.spike) {
            let metric: usize = rng.random_range(0..3);
            self.current[metric] = self.nominal[metric] * rng.random_range(1.25..1.6);
        }
        Some(self.reading(None))
    }

    fn reading(&mut self, event: Option<&'static str>) -> Reading {
        let first = !self.introduced;
        self.introduced = true;
        let round = |v: f64| (v * 10.0).round() / 10.0;
        let metrics = event.is_none();
        Reading {
            machine_id: self.id.clone(),
            event,
            name: first.then(|| self.name.clone()),
            machine_type: first.then(|| self.machine_type.clone()),
            location: first.then(|| self.location.clone()),
            temperature: metrics.then(|| round(self.current[0])),
            vibration: metrics.then(|| round(self.current[1])),
            load: metrics.then(|| round(self.current[2])),
        }
    }
}

/// Floor of a small plant: nominal temperature, vibration and load.
pub fn default_fleet() -> Vec<SimMachine> {
    vec![
        SimMachine::new("press-01", "Hydraulic Press 1", "Press", "Hall A", [55.0, 3.0, 60.0]),
        SimMachine::new("lathe-02", "CNC Lathe 2", "Lathe", "Hall A", [48.0, 4.5, 70.0]),
        SimMachine::new("pump-07", "Coolant Pump 7", "Pump", "Basement", [62.0, 5.5, 75.0]),
        SimMachine::new("robot-11", "Welding Robot 11", "Robot", "Hall C", [66.0, 2.0, 80.0]),
    ]
}
