//! Gateway between a mesh radio link and live dashboard subscribers.
//!
//! Telemetry decoded from the mesh is merged into per-machine state, checked
//! against thresholds and pushed to every connected WebSocket subscriber.

pub mod alerts;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod staleness;
pub mod state;
pub mod status;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::alerts::{AlertDebounce, AlertLog};
use crate::broadcast::{Broadcaster, SubscriberRegistry};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::ingest::TelemetryIngestor;
use crate::state::{new_state, GatewayState, Shared};

/// Every long-lived component of a running gateway, wired together.
#[derive(Clone)]
pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub state: Shared<GatewayState>,
    pub registry: SubscriberRegistry,
    pub health: HealthTracker,
    pub ingestor: Arc<TelemetryIngestor>,
}

impl Gateway {
    /// Wires the components. The returned broadcaster must be spawned for
    /// updates to reach subscribers.
    pub fn new(config: GatewayConfig) -> Result<(Self, Broadcaster), GatewayError> {
        config.validate()?;
        let state = new_state(GatewayState::new(
            AlertLog::new(config.alerts.capacity),
            AlertDebounce::new(config.alerts.debounce_window()),
        ));
        let registry = SubscriberRegistry::new(config.broadcast.subscriber_queue);
        let health = HealthTracker::new();
        let (publisher, broadcaster) =
            broadcast::handoff(config.broadcast.handoff_capacity, registry.clone(), health.clone());
        let ingestor = Arc::new(TelemetryIngestor::new(
            state.clone(),
            config.thresholds,
            config.alerts.snapshot_limit,
            publisher,
            health.clone(),
        ));
        let gateway = Self { config: Arc::new(config), state, registry, health, ingestor };
        Ok((gateway, broadcaster))
    }

    pub fn router(&self) -> Router {
        http::build_router(AppState {
            state: self.state.clone(),
            registry: self.registry.clone(),
            health: self.health.clone(),
            config: self.config.clone(),
        })
    }

    /// Serves HTTP on `listener` until `shutdown` resolves, then sends every
    /// subscriber a Close frame.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = self.registry.clone();
        let shutdown = async move {
            shutdown.await;
            let closed = registry.close_all();
            tracing::info!(closed, "subscribers closed");
        };
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
