use super::Runtime;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Fixed-period presence polling. Ticks never overlap: a slow tick delays
/// the next one instead of queueing a burst.
pub async fn run(rt: Arc<Runtime>, shutdown: CancellationToken) -> Result<()> {
    let mut interval = tokio::time::interval(rt.config.polling.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = interval.tick() => {}
        }

        let report = rt.poll_once(Utc::now()).await;
        if !report.failed.is_empty() {
            tracing::warn!(failed = ?report.failed, "Some notifications failed this tick");
        }
    }
}
