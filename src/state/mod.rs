//! Process-wide persisted state.
//!
//! One record holds presence, session statistics, notification dedup gates
//! and the command-channel cursor. Every field has a serde default, so a file
//! written by an older build loads without a migration step.

pub mod store;

use crate::engine::presence::PresenceState;
use crate::engine::stats::SessionStats;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use store::{FsWriter, StateStore, StateWriter, StoreError};

/// Schema version for forward compatibility
pub const STATE_VERSION: u32 = 1;

/// Error kinds remembered for alert dedup before the oldest is evicted
const MAX_ERROR_KINDS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    pub version: u32,
    #[serde(flatten)]
    pub presence: PresenceState,
    #[serde(flatten)]
    pub dedup: DedupWindows,
    #[serde(flatten)]
    pub cursor: CommandCursor,
    /// Announcement edited in place while a session is live
    pub main_message_id: Option<i64>,
    /// Session the main post announces
    pub main_session_key: Option<String>,
    pub last_main_text: Option<String>,
    pub session_stats: Option<SessionStats>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            presence: PresenceState::default(),
            dedup: DedupWindows::default(),
            cursor: CommandCursor::default(),
            main_message_id: None,
            main_session_key: None,
            last_main_text: None,
            session_stats: None,
        }
    }
}

impl State {
    /// Reset everything except the command cursor.
    pub fn reset_keeping_cursor(&mut self) {
        let cursor = std::mem::take(&mut self.cursor);
        *self = State {
            cursor,
            ..State::default()
        };
    }
}

/// "Don't repeat before T + window" gates, independent of presence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupWindows {
    pub last_start_sent_at: Option<DateTime<Utc>>,
    pub last_change_sent_at: Option<DateTime<Utc>>,
    /// Session an END was forwarded for
    pub last_end_session_key: Option<String>,
    /// Last operator alert about a competing command poller (HTTP 409)
    pub last_conflict_notify_at: Option<DateTime<Utc>>,
    /// Last operator alert about the disk being full
    pub last_quota_notify_at: Option<DateTime<Utc>>,
    pub error_notified_at: BTreeMap<String, DateTime<Utc>>,
}

/// Whether a gate last passed at `last` is open again at `now`.
pub fn window_open(last: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(at) => now - at >= window,
    }
}

impl DedupWindows {
    /// Gate for operator alerts, keyed by error kind. Records the pass.
    pub fn should_alert(&mut self, kind: &str, window: Duration, now: DateTime<Utc>) -> bool {
        let slot = match kind {
            "conflict" => Some(&mut self.last_conflict_notify_at),
            "no_space" => Some(&mut self.last_quota_notify_at),
            _ => None,
        };
        if let Some(slot) = slot {
            if !window_open(*slot, window, now) {
                return false;
            }
            *slot = Some(now);
            return true;
        }

        if !window_open(self.error_notified_at.get(kind).copied(), window, now) {
            return false;
        }
        self.error_notified_at.insert(kind.to_string(), now);
        while self.error_notified_at.len() > MAX_ERROR_KINDS {
            let oldest = self
                .error_notified_at
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.error_notified_at.remove(&k);
                }
                None => break,
            }
        }
        true
    }
}

/// Long-poll cursor of the command channel and its watchdog bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandCursor {
    /// Last processed update id + 1; `None` means "drop whatever is pending"
    pub next_update_offset: Option<i64>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_command_seen_at: Option<DateTime<Utc>>,
    pub last_recovery_at: Option<DateTime<Utc>>,
}

impl CommandCursor {
    /// Advance past a batch of update ids. The cursor never moves backwards.
    pub fn advance_past(&mut self, ids: impl IntoIterator<Item = i64>) -> bool {
        let Some(max) = ids.into_iter().max() else {
            return false;
        };
        let next = max + 1;
        if self.next_update_offset.map_or(true, |cur| next > cur) {
            self.next_update_offset = Some(next);
            return true;
        }
        false
    }
}
