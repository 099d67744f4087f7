use super::Runtime;
use crate::state::{window_open, CommandCursor};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Whether the command channel has been silent for longer than `silence`
/// and the last recovery is at least `cooldown` old.
///
/// Silence is measured from the later of the last successful poll and the
/// process start, so a poll time persisted by a previous run does not count.
pub fn needs_recovery(
    cursor: &CommandCursor,
    process_started: DateTime<Utc>,
    silence: Duration,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> bool {
    let reference = cursor
        .last_poll_at
        .map_or(process_started, |at| at.max(process_started));
    now - reference >= silence && window_open(cursor.last_recovery_at, cooldown, now)
}

pub async fn run(rt: Arc<Runtime>, shutdown: CancellationToken) -> Result<()> {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        rt.config.watchdog.interval_secs.max(1),
    ));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = interval.tick() => {}
        }
        rt.watchdog_check(Utc::now()).await;
    }
}

impl Runtime {
    /// Force the command channel to start over when it has gone quiet.
    /// Returns whether a recovery was triggered.
    pub async fn watchdog_check(&self, now: DateTime<Utc>) -> bool {
        let silence = Duration::seconds(self.config.watchdog.silence_secs as i64);
        let cooldown = Duration::seconds(self.config.watchdog.cooldown_secs as i64);

        {
            let mut state = self.state.lock().await;
            if !needs_recovery(&state.cursor, self.started_at, silence, cooldown, now) {
                return false;
            }

            tracing::warn!(
                last_poll = ?state.cursor.last_poll_at,
                "Command channel silent, dropping pending updates and restarting poll"
            );
            state.cursor.next_update_offset = None;
            state.cursor.last_recovery_at = Some(now);
            self.persist(&mut state, now).await;

            let text = format!(
                "⚠️ Command channel was silent for over {} s; pending updates dropped and polling restarted.",
                silence.num_seconds()
            );
            self.dispatcher
                .alert_operator(&mut state.dedup, "watchdog", &text, now)
                .await;
        }

        self.command_restart.notify_one();
        true
    }
}
