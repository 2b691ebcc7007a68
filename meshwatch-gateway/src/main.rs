/**
 * MESHWATCH GATEWAY - process entry point
 *
 * ROLE: load configuration, wire the gateway, start the broadcaster, the
 * mesh listener and the optional staleness monitor, then serve HTTP until
 * Ctrl-C / SIGTERM.
 *
 * A missing mesh broker is not fatal: the listener keeps retrying while the
 * dashboard is served whatever state is known. Only a failed bind stops us.
 */

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshwatch_gateway::config::load_config;
use meshwatch_gateway::mqtt::spawn_mesh_listener;
use meshwatch_gateway::staleness::spawn_staleness_monitor;
use meshwatch_gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshwatch_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config().await;
    let (gateway, broadcaster) = Gateway::new(config).context("invalid gateway configuration")?;
    let cfg = gateway.config.clone();

    broadcaster.spawn();
    spawn_mesh_listener(cfg.mesh.clone(), gateway.ingestor.clone(), gateway.health.clone());
    spawn_staleness_monitor(&cfg.staleness, gateway.ingestor.clone());

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.bind))?;
    tracing::info!(addr = %cfg.http.bind, "listening for subscribers on /ws");

    gateway.serve(listener, shutdown_signal()).await?;
    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Ctrl-C received, shutting down"),
        () = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
