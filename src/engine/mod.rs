//! Presence detection and session statistics.
//!
//! [`step`] is the whole per-tick core: it advances the presence state
//! machine, keeps the session statistics in step with the session identity,
//! and attaches finalized statistics to END events. Everything here is
//! synchronous and clock-free so it can be driven directly from tests.

pub mod presence;
pub mod stats;

use crate::config::Config;
use crate::data::{Event, PlatformSnapshot};
use chrono::{DateTime, Duration, Utc};
use presence::PresenceState;
use stats::SessionStats;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub confirm_threshold: u32,
    /// Creation tokens closer than this identify the same session
    pub session_tolerance: Duration,
    /// Upper bound for one stats interval
    pub max_gap: Duration,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confirm_threshold: config.polling.confirm_threshold.max(1),
            session_tolerance: Duration::seconds(config.polling.session_tolerance_secs as i64),
            max_gap: config.polling.max_gap(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Process one tick of snapshots.
pub fn step(
    presence: &mut PresenceState,
    session_stats: &mut Option<SessionStats>,
    kick: &PlatformSnapshot,
    vk: &PlatformSnapshot,
    cfg: &EngineConfig,
    now: DateTime<Utc>,
) -> Vec<Event> {
    let advance = presence::advance(presence, kick, vk, cfg, now);
    let next = advance.state;
    let mut events = advance.events;

    if advance.new_session {
        if let Some(old) = session_stats.take() {
            tracing::debug!(session = %old.session_key, "discarding previous session stats");
        }
    }

    // A live tick needs a record for the current session. This also covers a
    // state file written before the record existed, or one whose record
    // belongs to a different session.
    if next.any_live {
        let matches_session = session_stats.as_ref().is_some_and(|s| {
            !s.is_finalized() && s.session_started_at == next.session_started_at
        });
        if !matches_session {
            *session_stats = Some(SessionStats::new(
                next.session_key().unwrap_or_default(),
                next.session_started_at,
                now,
            ));
        }
    }

    if let Some(stats) = session_stats.as_mut() {
        stats.tick(kick, vk, cfg.max_gap, now);
        if stats.session_key.is_empty() || stats.session_started_at == next.session_started_at {
            if let Some(key) = next.session_key() {
                stats.session_key = key;
            }
        }
    }

    for event in events.iter_mut() {
        if let Event::End {
            session_key,
            ended_at,
            stats,
            ..
        } = event
        {
            if let Some(record) = session_stats.as_mut() {
                record.finalize(*ended_at);
                if record.session_key != *session_key {
                    tracing::warn!(
                        expected = %session_key,
                        found = %record.session_key,
                        "session stats key mismatch at end"
                    );
                }
                *stats = Some(Box::new(record.clone()));
            }
        }
    }

    *presence = next;
    events
}
