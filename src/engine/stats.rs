//! Session-scoped statistics: viewer aggregates, content timelines and
//! per-label durations for each platform.

use super::presence::label_changed;
use crate::data::{PerPlatform, Platform, PlatformSnapshot};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Distinct labels kept per duration map before spilling into [`OVERFLOW_LABEL`]
pub const MAX_LABEL_KEYS: usize = 24;
pub const MAX_TIMELINE_SEGMENTS: usize = 256;
pub const MAX_LABEL_CHARS: usize = 200;
pub const OVERFLOW_LABEL: &str = "(other)";
pub const UNKNOWN_LABEL: &str = "(unknown)";

/// A `[start, end)` interval of a timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

impl Segment {
    pub fn seconds(&self) -> u64 {
        (self.end - self.start).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerStats {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub sum: u64,
    pub sample_count: u64,
    pub peak_at: Option<DateTime<Utc>>,
    pub min_at: Option<DateTime<Utc>>,
}

impl ViewerStats {
    pub fn record(&mut self, viewers: u64, at: DateTime<Utc>) {
        if self.max.map_or(true, |max| viewers > max) {
            self.max = Some(viewers);
            self.peak_at = Some(at);
        }
        if self.min.map_or(true, |min| viewers < min) {
            self.min = Some(viewers);
            self.min_at = Some(at);
        }
        self.sum = self.sum.saturating_add(viewers);
        self.sample_count += 1;
    }

    pub fn average(&self) -> Option<f64> {
        (self.sample_count > 0).then(|| self.sum as f64 / self.sample_count as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformStats {
    pub viewers: ViewerStats,
    pub title_change_count: u32,
    pub category_change_count: u32,
    pub live_seconds: u64,
    pub category_duration: BTreeMap<String, u64>,
    pub title_duration: BTreeMap<String, u64>,
    pub category_timeline: Vec<Segment>,
    pub title_timeline: Vec<Segment>,
    /// Live at the previous tick
    pub was_live: bool,
    pub last_category: Option<String>,
    pub last_title: Option<String>,
}

impl PlatformStats {
    /// Categories sorted by accumulated time, longest first
    pub fn categories_by_time(&self) -> Vec<(&str, u64)> {
        let mut entries: Vec<(&str, u64)> = self
            .category_duration
            .iter()
            .map(|(label, secs)| (label.as_str(), *secs))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStats {
    pub session_key: String,
    /// `PresenceState::session_started_at` this record belongs to
    pub session_started_at: Option<DateTime<Utc>>,
    /// When aggregation began (first tick of the session)
    pub anchored_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_tick_at: DateTime<Utc>,
    pub platforms: PerPlatform<PlatformStats>,
    pub both_live_seconds: u64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            session_key: String::new(),
            session_started_at: None,
            anchored_at: DateTime::UNIX_EPOCH,
            ended_at: None,
            last_tick_at: DateTime::UNIX_EPOCH,
            platforms: PerPlatform::default(),
            both_live_seconds: 0,
        }
    }
}

impl SessionStats {
    pub fn new(
        session_key: String,
        session_started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_key,
            session_started_at,
            anchored_at: now,
            last_tick_at: now,
            ..Self::default()
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Live seconds summed over both platforms (overlap counted twice)
    pub fn total_live_seconds(&self) -> u64 {
        self.platforms.kick.live_seconds + self.platforms.vk.live_seconds
    }

    /// Fold one tick of observations into the statistics.
    ///
    /// The interval `[last_tick_at, now)` belongs to every platform that was
    /// live at `last_tick_at`, labelled with that platform's previous labels.
    /// The interval is clamped to `max_gap` so an outage or restart gap does
    /// not inflate durations. A finalized record is left untouched.
    pub fn tick(
        &mut self,
        kick: &PlatformSnapshot,
        vk: &PlatformSnapshot,
        max_gap: Duration,
        now: DateTime<Utc>,
    ) {
        if self.is_finalized() {
            return;
        }

        let snaps = PerPlatform::new(kick, vk);
        let elapsed = (now - self.last_tick_at).max(Duration::zero());
        let delta = elapsed.min(max_gap);
        let secs = delta.num_seconds().max(0) as u64;
        let start = self.last_tick_at;
        let end = start + delta;
        let both_were_live = self.platforms.kick.was_live && self.platforms.vk.was_live;

        for platform in Platform::ALL {
            let snap = snaps[platform];
            let ps = &mut self.platforms[platform];

            if ps.was_live && secs > 0 {
                let category = label_or_unknown(ps.last_category.as_deref());
                let title = label_or_unknown(ps.last_title.as_deref());
                ps.live_seconds += secs;
                add_duration(&mut ps.category_duration, &category, secs);
                add_duration(&mut ps.title_duration, &title, secs);
                push_segment(&mut ps.category_timeline, start, end, category);
                push_segment(&mut ps.title_timeline, start, end, title);
            }

            if snap.live {
                if ps.was_live {
                    if label_changed(ps.last_title.as_deref(), snap.title.as_deref()) {
                        ps.title_change_count += 1;
                    }
                    if label_changed(ps.last_category.as_deref(), snap.category.as_deref()) {
                        ps.category_change_count += 1;
                    }
                    // Keep the previous label when the source lost it for a tick
                    if snap.title.is_some() {
                        ps.last_title = snap.title.clone();
                    }
                    if snap.category.is_some() {
                        ps.last_category = snap.category.clone();
                    }
                } else {
                    ps.last_title = snap.title.clone();
                    ps.last_category = snap.category.clone();
                }
                if let Some(viewers) = snap.viewer_count {
                    ps.viewers.record(viewers, now);
                }
            }
            ps.was_live = snap.live;
        }

        if both_were_live && secs > 0 {
            self.both_live_seconds += secs;
        }
        self.last_tick_at = now;
    }

    /// Close the record. Nothing mutates it afterwards.
    pub fn finalize(&mut self, ended_at: DateTime<Utc>) {
        if self.is_finalized() {
            return;
        }
        self.ended_at = Some(ended_at);
        for platform in Platform::ALL {
            self.platforms[platform].was_live = false;
        }
    }
}

/// Functional form of [`SessionStats::tick`].
pub fn tick(
    mut stats: SessionStats,
    kick: &PlatformSnapshot,
    vk: &PlatformSnapshot,
    max_gap: Duration,
    now: DateTime<Utc>,
) -> SessionStats {
    stats.tick(kick, vk, max_gap, now);
    stats
}

fn label_or_unknown(label: Option<&str>) -> String {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(l) => clip_label(l),
        None => UNKNOWN_LABEL.to_string(),
    }
}

fn clip_label(label: &str) -> String {
    if label.chars().count() <= MAX_LABEL_CHARS {
        label.to_string()
    } else {
        let clipped: String = label.chars().take(MAX_LABEL_CHARS - 3).collect();
        format!("{}...", clipped)
    }
}

fn add_duration(map: &mut BTreeMap<String, u64>, label: &str, secs: u64) {
    let key = if map.contains_key(label) || map.len() < MAX_LABEL_KEYS {
        label
    } else {
        OVERFLOW_LABEL
    };
    *map.entry(key.to_string()).or_insert(0) += secs;
}

/// Append a segment, extending the last one when it is contiguous and
/// carries the same label.
fn push_segment(timeline: &mut Vec<Segment>, start: DateTime<Utc>, end: DateTime<Utc>, label: String) {
    if let Some(last) = timeline.last_mut() {
        if last.label == label && last.end == start {
            last.end = end;
            return;
        }
    }
    timeline.push(Segment { start, end, label });

    while timeline.len() > MAX_TIMELINE_SEGMENTS {
        let second = timeline.remove(1);
        let first = &mut timeline[0];
        first.end = second.end;
        first.label = OVERFLOW_LABEL.to_string();
    }
}
