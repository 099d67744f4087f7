//! Presence state machine.
//!
//! Consumes one snapshot per platform each tick and decides which transition
//! events fire. Pure: no I/O, no clock, no dedup windows (the dispatcher owns
//! those).

use super::EngineConfig;
use crate::data::{ChangeField, Event, FieldChange, PerPlatform, Platform, PlatformSnapshot};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted presence of the broadcaster across both platforms
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceState {
    /// Always `live.kick || live.vk` as of the last processed tick
    pub any_live: bool,
    pub live: PerPlatform<bool>,
    pub session_started_at: Option<DateTime<Utc>>,
    /// Authoritative creation token of the current (or last) session
    pub session_token: Option<String>,
    /// Consecutive ticks observed fully offline
    pub offline_streak: u32,
    /// First fully-offline observation of the current streak
    pub offline_since: Option<DateTime<Utc>>,
    pub last_title: PerPlatform<Option<String>>,
    pub last_category: PerPlatform<Option<String>>,
    pub last_viewers: PerPlatform<Option<u64>>,
    /// Session key an END has already been emitted for
    pub end_notified_for_session: Option<String>,
}

impl PresenceState {
    /// Identity of the current session: the creation token when one is known,
    /// otherwise the start timestamp.
    pub fn session_key(&self) -> Option<String> {
        match (&self.session_token, self.session_started_at) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(started)) => Some(started.to_rfc3339()),
            (None, None) => None,
        }
    }

    pub fn in_session(&self) -> bool {
        self.session_started_at.is_some()
    }
}

/// Result of one engine tick
#[derive(Debug, Clone)]
pub struct Advance {
    pub state: PresenceState,
    pub events: Vec<Event>,
    /// A new session began this tick; previous statistics must be discarded
    pub new_session: bool,
}

/// Parse a platform session token into a timestamp.
///
/// Kick reports `2024-05-01 18:03:21` (UTC, no zone); RFC 3339 is accepted too.
pub fn parse_token_time(token: &str) -> Option<DateTime<Utc>> {
    let token = token.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(token) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(token, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Whether two tokens identify the same session, allowing small clock jitter
/// between reports.
pub fn same_session(a: &str, b: &str, tolerance: chrono::Duration) -> bool {
    match (parse_token_time(a), parse_token_time(b)) {
        (Some(x), Some(y)) => (x - y).num_seconds().abs() <= tolerance.num_seconds(),
        _ => a == b,
    }
}

/// Advance the presence state machine by one tick.
pub fn advance(
    prev: &PresenceState,
    kick: &PlatformSnapshot,
    vk: &PlatformSnapshot,
    cfg: &EngineConfig,
    now: DateTime<Utc>,
) -> Advance {
    let snaps = PerPlatform::new(kick, vk);
    let any_live_now = kick.live || vk.live;
    let mut next = prev.clone();
    let mut events = Vec::new();

    let new_session = if any_live_now {
        sync_session(prev, &mut next, kick, cfg, now)
    } else {
        false
    };

    // Start
    if !prev.any_live && any_live_now {
        let started_at = *next.session_started_at.get_or_insert(now);
        if let Some(session_key) = next.session_key() {
            events.push(Event::Start {
                session_key,
                started_at,
            });
        }
    }

    // Change (viewer counts never count)
    if prev.any_live && any_live_now {
        let changes = detect_changes(prev, &snaps);
        if !changes.is_empty() {
            events.push(Event::Change { changes });
        }
    }

    // Partial stop
    for platform in Platform::ALL {
        let other = platform.other();
        if prev.live[platform] && !snaps[platform].live && snaps[other].live {
            events.push(Event::PartialEnd {
                stopped: platform,
                continuing: other,
            });
        }
    }

    // Confirmed end
    if any_live_now {
        next.offline_streak = 0;
        next.offline_since = None;
    } else {
        next.offline_streak = prev.offline_streak.saturating_add(1);
        let offline_since = *next.offline_since.get_or_insert(now);

        if next.offline_streak >= cfg.confirm_threshold {
            if let (Some(started_at), Some(session_key)) =
                (next.session_started_at, next.session_key())
            {
                if next.end_notified_for_session.as_deref() != Some(session_key.as_str()) {
                    events.push(Event::End {
                        session_key: session_key.clone(),
                        started_at,
                        ended_at: offline_since,
                        stats: None,
                    });
                }
                next.end_notified_for_session = Some(session_key);
                next.session_started_at = None;
                next.offline_streak = 0;
                next.offline_since = None;
            }
        }
    }

    for platform in Platform::ALL {
        let snap = snaps[platform];
        next.live[platform] = snap.live;
        next.last_viewers[platform] = snap.viewer_count;
        if snap.live {
            // An unreadable label keeps the last known one, so a later
            // change is still compared against it
            keep_known(&mut next.last_title[platform], &snap.title);
            keep_known(&mut next.last_category[platform], &snap.category);
        } else {
            next.last_title[platform] = None;
            next.last_category[platform] = None;
        }
    }
    next.any_live = next.live.kick || next.live.vk;

    Advance {
        state: next,
        events,
        new_session,
    }
}

/// Reconcile the recorded session with what the platforms report.
///
/// Returns true when a new session begins.
fn sync_session(
    prev: &PresenceState,
    next: &mut PresenceState,
    kick: &PlatformSnapshot,
    cfg: &EngineConfig,
    now: DateTime<Utc>,
) -> bool {
    // Only Kick reports an authoritative creation time
    let token = kick
        .live
        .then(|| kick.session_token.as_deref())
        .flatten()
        .filter(|t| !t.trim().is_empty());

    match token {
        Some(token) => {
            let token_time = parse_token_time(token);
            match prev.session_token.as_deref() {
                Some(recorded) if same_session(recorded, token, cfg.session_tolerance) => {
                    if next.session_started_at.is_none() {
                        // Same platform stream resumed after a confirmed end.
                        // END stays suppressed for this key.
                        next.session_started_at = Some(token_time.unwrap_or(now));
                        return true;
                    }
                    false
                }
                None if prev.session_started_at.is_some() => {
                    // A tokenless session is in progress; adopt the token
                    next.session_token = Some(token.to_string());
                    false
                }
                _ => {
                    begin_session(next, Some(token.to_string()), token_time.unwrap_or(now));
                    true
                }
            }
        }
        None => {
            if prev.session_started_at.is_none() {
                begin_session(next, None, now);
                true
            } else {
                false
            }
        }
    }
}

fn begin_session(next: &mut PresenceState, token: Option<String>, started_at: DateTime<Utc>) {
    tracing::debug!(token = ?token, %started_at, "new session");
    next.session_token = token;
    next.session_started_at = Some(started_at);
    next.offline_streak = 0;
    next.offline_since = None;
    next.end_notified_for_session = None;
}

/// A label change needs both an old and a new value. A missing value means
/// the source failed to read it, not that it was cleared.
pub(crate) fn label_changed(old: Option<&str>, new: Option<&str>) -> bool {
    matches!((old, new), (Some(o), Some(n)) if o != n)
}

fn keep_known(recorded: &mut Option<String>, observed: &Option<String>) {
    if let Some(label) = observed {
        *recorded = Some(label.clone());
    }
}

fn detect_changes(prev: &PresenceState, snaps: &PerPlatform<&PlatformSnapshot>) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for platform in Platform::ALL {
        let snap = snaps[platform];
        if !(prev.live[platform] && snap.live) {
            continue;
        }
        let fields = [
            (ChangeField::Title, &prev.last_title[platform], &snap.title),
            (ChangeField::Category, &prev.last_category[platform], &snap.category),
        ];
        for (field, old, new) in fields {
            if label_changed(old.as_deref(), new.as_deref()) {
                changes.push(FieldChange {
                    platform,
                    field,
                    from: old.clone(),
                    to: new.clone().unwrap_or_default(),
                });
            }
        }
    }
    changes
}
