use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::config::StalenessConf;
use crate::ingest::TelemetryIngestor;

/// Periodically marks silent machines offline. Returns `None` when expiry is
/// disabled, which is the default: records then live until an explicit
/// offline event.
pub fn spawn_staleness_monitor(
    cfg: &StalenessConf,
    ingestor: Arc<TelemetryIngestor>,
) -> Option<JoinHandle<()>> {
    let max_silence = Duration::from_secs(cfg.offline_after_secs?);
    let period = Duration::from_secs(cfg.check_interval_secs.max(1));
    tracing::info!(offline_after_secs = max_silence.as_secs(), "starting staleness monitor");

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let expired = ingestor.expire_silent(max_silence, OffsetDateTime::now_utc());
            if !expired.is_empty() {
                tracing::info!(count = expired.len(), "silent machines marked offline");
            }
        }
    }))
}
