use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// A watched streaming platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Kick,
    Vk,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Kick, Platform::Vk];

    pub fn other(self) -> Platform {
        match self {
            Platform::Kick => Platform::Vk,
            Platform::Vk => Platform::Kick,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Platform::Kick => "Kick",
            Platform::Vk => "VK",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One value per platform, indexable by [`Platform`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerPlatform<T> {
    pub kick: T,
    pub vk: T,
}

impl<T> PerPlatform<T> {
    pub fn new(kick: T, vk: T) -> Self {
        Self { kick, vk }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Platform, &T)> {
        [(Platform::Kick, &self.kick), (Platform::Vk, &self.vk)].into_iter()
    }
}

impl<T> Index<Platform> for PerPlatform<T> {
    type Output = T;

    fn index(&self, platform: Platform) -> &T {
        match platform {
            Platform::Kick => &self.kick,
            Platform::Vk => &self.vk,
        }
    }
}

impl<T> IndexMut<Platform> for PerPlatform<T> {
    fn index_mut(&mut self, platform: Platform) -> &mut T {
        match platform {
            Platform::Kick => &mut self.kick,
            Platform::Vk => &mut self.vk,
        }
    }
}

/// Point-in-time read of one platform's live status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    pub live: bool,
    pub title: Option<String>,
    pub category: Option<String>,
    pub viewer_count: Option<u64>,
    /// Platform-reported stream creation time, used as session identity
    pub session_token: Option<String>,
    pub thumbnail_url: Option<String>,
    pub playback_url: Option<String>,
}

impl PlatformSnapshot {
    /// Snapshot used when a source could not be read (fail-safe-to-offline)
    pub fn offline() -> Self {
        Self::default()
    }

    /// Minimal live snapshot, mostly for tests and fixtures
    pub fn live(category: &str, title: &str) -> Self {
        Self {
            live: true,
            title: Some(title.to_string()),
            category: Some(category.to_string()),
            ..Self::default()
        }
    }

    pub fn with_viewers(mut self, viewers: u64) -> Self {
        self.viewer_count = Some(viewers);
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.session_token = Some(token.to_string());
        self
    }
}

/// Which content field changed on a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeField {
    Title,
    Category,
}

impl fmt::Display for ChangeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeField::Title => f.write_str("title"),
            ChangeField::Category => f.write_str("category"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub platform: Platform,
    pub field: ChangeField,
    pub from: Option<String>,
    pub to: String,
}

/// Transition decided by the presence engine for one tick
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start {
        session_key: String,
        started_at: DateTime<Utc>,
    },
    Change {
        changes: Vec<FieldChange>,
    },
    PartialEnd {
        stopped: Platform,
        continuing: Platform,
    },
    End {
        session_key: String,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        /// Finalized statistics, attached by the engine step after the final aggregator tick
        stats: Option<Box<crate::engine::stats::SessionStats>>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Start { .. } => EventKind::Start,
            Event::Change { .. } => EventKind::Change,
            Event::PartialEnd { .. } => EventKind::PartialEnd,
            Event::End { .. } => EventKind::End,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Change,
    PartialEnd,
    End,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Change => "change",
            EventKind::PartialEnd => "partial_end",
            EventKind::End => "end",
        }
    }
}
