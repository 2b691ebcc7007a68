use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::broadcast::SubscriberRegistry;
use crate::state::{GatewayState, Shared};

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub uptime_seconds: u64,
    pub machines_tracked: u32,
    pub alerts_stored: u32,
    pub subscribers: u32,
    pub memory_usage_mb: f32,
    pub mesh_status: String,
    pub mesh_reconnects: u32,
    pub payloads_ingested: u64,
    pub payloads_dropped: u64,
    pub updates_dropped: u64,
}

/// Self-health counters shared by the mesh listener, the ingestor and the
/// broadcaster.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mesh_reconnects: Arc<AtomicU32>,
    mesh_status: Arc<parking_lot::Mutex<String>>,
    ingested: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    updates_dropped: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mesh_reconnects: Arc::new(AtomicU32::new(0)),
            mesh_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
            ingested: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            updates_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_mesh_connected(&self) {
        *self.mesh_status.lock() = "connected".to_string();
    }

    /// Counts a reconnect only on the connected → disconnected edge.
    pub fn mark_mesh_disconnected(&self) {
        let mut status = self.mesh_status.lock();
        if *status == "connected" {
            self.mesh_reconnects.fetch_add(1, Ordering::Relaxed);
        }
        *status = "disconnected".to_string();
    }

    pub fn mesh_status(&self) -> String {
        self.mesh_status.lock().clone()
    }

    pub fn record_ingested(&self) {
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_dropped(&self) {
        self.updates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, state: &Shared<GatewayState>, registry: &SubscriberRegistry) -> GatewayHealth {
        let (machines, alerts) = {
            let st = state.lock();
            (st.machines().len() as u32, st.alerts().len() as u32)
        };
        GatewayHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            machines_tracked: machines,
            alerts_stored: alerts,
            subscribers: registry.len() as u32,
            memory_usage_mb: get_memory_usage_mb(),
            mesh_status: self.mesh_status(),
            mesh_reconnects: self.mesh_reconnects.load(Ordering::Relaxed),
            payloads_ingested: self.ingested.load(Ordering::Relaxed),
            payloads_dropped: self.dropped.load(Ordering::Relaxed),
            updates_dropped: self.updates_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_state;

    #[test]
    fn reconnects_count_only_lost_connections() {
        let h = HealthTracker::new();
        h.mark_mesh_disconnected();
        h.mark_mesh_disconnected();
        assert_eq!(h.mesh_reconnects.load(Ordering::Relaxed), 0);
        h.mark_mesh_connected();
        h.mark_mesh_disconnected();
        assert_eq!(h.mesh_reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(h.mesh_status(), "disconnected");
    }

    #[test]
    fn health_reports_counters() {
        let h = HealthTracker::new();
        h.record_ingested();
        h.record_ingested();
        h.record_dropped();
        let report = h.get_health(&new_state(GatewayState::default()), &SubscriberRegistry::new(4));
        assert_eq!(report.payloads_ingested, 2);
        assert_eq!(report.payloads_dropped, 1);
        assert_eq!(report.machines_tracked, 0);
        assert_eq!(report.subscribers, 0);
        assert_eq!(report.mesh_status, "connecting");
    }
}
