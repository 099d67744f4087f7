//! Plain-text renderers for everything the bot posts.

use crate::config::SourcesConfig;
use crate::data::{ChangeField, FieldChange, PerPlatform, Platform, PlatformSnapshot};
use crate::engine::presence::PresenceState;
use crate::engine::stats::{PlatformStats, SessionStats};
use crate::state::State;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Category lines shown per platform in reports
const MAX_REPORT_CATEGORIES: usize = 5;

/// Public channel URLs appended to announcements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Links {
    pub kick: String,
    pub vk: String,
}

impl Links {
    pub fn from_config(sources: &SourcesConfig) -> Self {
        Self {
            kick: sources.kick_public_url(),
            vk: sources.vk_public_url(),
        }
    }

    pub fn get(&self, platform: Platform) -> &str {
        match platform {
            Platform::Kick => &self.kick,
            Platform::Vk => &self.vk,
        }
    }

    fn footer(&self) -> String {
        format!("Kick: {}\nVK: {}", self.kick, self.vk)
    }
}

/// `02 h 05 min`
pub fn fmt_duration(secs: u64) -> String {
    format!("{:02} h {:02} min", secs / 3600, (secs % 3600) / 60)
}

fn fmt_time(at: DateTime<Utc>) -> String {
    at.format("%H:%M UTC").to_string()
}

fn platform_line(platform: Platform, live: bool, category: Option<&str>, title: Option<&str>) -> String {
    if !live {
        return format!("{}: OFF", platform);
    }
    format!(
        "{}: {} — {}",
        platform,
        category.unwrap_or("—"),
        title.unwrap_or("—")
    )
}

/// The main announcement, edited in place while the session runs.
pub fn main_text(presence: &PresenceState, links: &Links) -> String {
    let mut out = String::from("🔴 Stream is live!\n\n");
    for platform in Platform::ALL {
        out.push_str(&platform_line(
            platform,
            presence.live[platform],
            presence.last_category[platform].as_deref(),
            presence.last_title[platform].as_deref(),
        ));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&links.footer());
    out
}

pub fn change_text(changes: &[FieldChange]) -> String {
    let mut out = String::from("✏️ Stream updated\n");
    for change in changes {
        let field = match change.field {
            ChangeField::Title => "title",
            ChangeField::Category => "category",
        };
        let _ = write!(
            out,
            "\n{} {}: {} → {}",
            change.platform,
            field,
            change.from.as_deref().unwrap_or("—"),
            change.to
        );
    }
    out
}

pub fn partial_end_text(stopped: Platform, continuing: Platform, links: &Links) -> String {
    format!(
        "{} stream ended, still live on {}:\n{}",
        stopped,
        continuing,
        links.get(continuing)
    )
}

fn platform_report(out: &mut String, platform: Platform, ps: &PlatformStats) {
    if ps.live_seconds == 0 && ps.viewers.sample_count == 0 {
        return;
    }
    let _ = write!(out, "\n{}: live {}", platform, fmt_duration(ps.live_seconds));
    if let (Some(peak), Some(at)) = (ps.viewers.max, ps.viewers.peak_at) {
        let _ = write!(out, ", peak {} viewers at {}", peak, fmt_time(at));
    }
    if let Some(avg) = ps.viewers.average() {
        let _ = write!(out, ", avg {:.0}", avg);
    }
    for (label, secs) in ps.categories_by_time().into_iter().take(MAX_REPORT_CATEGORIES) {
        let _ = write!(out, "\n  • {}: {}", label, fmt_duration(secs));
    }
    if ps.title_change_count > 0 || ps.category_change_count > 0 {
        let _ = write!(
            out,
            "\n  changes: {} title, {} category",
            ps.title_change_count, ps.category_change_count
        );
    }
}

/// Session summary sent once the end is confirmed.
pub fn end_text(
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    stats: Option<&SessionStats>,
    links: &Links,
) -> String {
    let duration = (ended_at - started_at).num_seconds().max(0) as u64;
    let mut out = format!("⚫ Stream ended\nDuration: {}", fmt_duration(duration));

    if let Some(stats) = stats {
        for platform in Platform::ALL {
            platform_report(&mut out, platform, &stats.platforms[platform]);
        }
        if stats.both_live_seconds > 0 {
            let _ = write!(out, "\nBoth platforms: {}", fmt_duration(stats.both_live_seconds));
        }
    }

    out.push_str("\n\n");
    out.push_str(&links.footer());
    out
}

/// Reply to `/status`; used as a photo caption when a frame is available.
pub fn status_text(snaps: &PerPlatform<PlatformSnapshot>, links: &Links) -> String {
    if !snaps.kick.live && !snaps.vk.live {
        return "Nothing live right now.".to_string();
    }
    let mut out = String::from("Live now:\n");
    for (platform, snap) in snaps.iter() {
        out.push_str(&platform_line(
            platform,
            snap.live,
            snap.category.as_deref(),
            snap.title.as_deref(),
        ));
        if let Some(viewers) = snap.viewer_count.filter(|_| snap.live) {
            let _ = write!(out, " ({} viewers)", viewers);
        }
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&links.footer());
    out
}

/// Reply to `/stats`
pub fn stats_text(stats: Option<&SessionStats>, now: DateTime<Utc>) -> String {
    let Some(stats) = stats.filter(|s| !s.is_finalized()) else {
        return "No session in progress.".to_string();
    };
    let started = stats.session_started_at.unwrap_or(stats.anchored_at);
    let elapsed = (now - started).num_seconds().max(0) as u64;
    let mut out = format!(
        "Session running for {} (since {})",
        fmt_duration(elapsed),
        fmt_time(started)
    );
    for platform in Platform::ALL {
        platform_report(&mut out, platform, &stats.platforms[platform]);
    }
    if stats.both_live_seconds > 0 {
        let _ = write!(out, "\nBoth platforms: {}", fmt_duration(stats.both_live_seconds));
    }
    out
}

pub fn help_text() -> String {
    [
        "/status - what is live right now",
        "/stats - current session statistics",
        "/help - this message",
        "/diag - diagnostics (operator)",
        "/reset - reset watcher state (operator)",
    ]
    .join("\n")
}

fn fmt_opt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

/// Reply to `/diag`
pub fn diag_text(state: &State, state_path: &str, started_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let p = &state.presence;
    let mut out = String::from("Diagnostics\n");
    let _ = writeln!(out, "uptime: {}", fmt_duration((now - started_at).num_seconds().max(0) as u64));
    let _ = writeln!(out, "live: kick={} vk={} any={}", p.live.kick, p.live.vk, p.any_live);
    let _ = writeln!(out, "session: {}", p.session_key().unwrap_or_else(|| "-".to_string()));
    let _ = writeln!(out, "offline streak: {} (since {})", p.offline_streak, fmt_opt_time(p.offline_since));
    let _ = writeln!(out, "end notified for: {}", p.end_notified_for_session.as_deref().unwrap_or("-"));
    let _ = writeln!(out, "last start sent: {}", fmt_opt_time(state.dedup.last_start_sent_at));
    let _ = writeln!(out, "last change sent: {}", fmt_opt_time(state.dedup.last_change_sent_at));
    let _ = writeln!(
        out,
        "command offset: {}",
        state
            .cursor
            .next_update_offset
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    let _ = writeln!(out, "last command poll: {}", fmt_opt_time(state.cursor.last_poll_at));
    let _ = writeln!(out, "last recovery: {}", fmt_opt_time(state.cursor.last_recovery_at));
    let _ = writeln!(out, "main message: {}", state.main_message_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()));
    let _ = write!(out, "state file: {}", state_path);
    out
}
