//! VK Video Live, scraped from the public channel page.
//!
//! The page is a Next.js app; the stream state lives somewhere inside the
//! `__NEXT_DATA__` JSON blob. Its exact shape is not stable, so we search for
//! the first object carrying a plausible `streamInfo` and fall back to the
//! `og:title` meta tag for the title. No creation token is exposed.

use super::retry::{send_with_retry, RetryPolicy};
use super::{SourceAdapter, HTTP_CLIENT, USER_AGENT};
use crate::config::Config;
use crate::data::{Platform, PlatformSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static NEXT_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<script[^>]+id="__NEXT_DATA__"[^>]*>(.*?)</script>"#)
        .expect("valid __NEXT_DATA__ regex")
});

static OG_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+property="og:title"[^>]+content="([^"]+)""#)
        .expect("valid og:title regex")
});

const LIVE_STATUSES: [&str; 3] = ["ONLINE", "LIVE", "STREAMING"];

/// Bound on JSON nesting walked while searching for the stream container
const MAX_SEARCH_DEPTH: usize = 64;

pub struct VkSource {
    url: String,
    policy: RetryPolicy,
}

impl VkSource {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.sources.vk_public_url(),
            policy: RetryPolicy::sources(&config.retry),
        }
    }
}

#[async_trait]
impl SourceAdapter for VkSource {
    fn platform(&self) -> Platform {
        Platform::Vk
    }

    async fn fetch(&self) -> Result<PlatformSnapshot> {
        let response = send_with_retry(&self.policy, "VK page fetch", || {
            HTTP_CLIENT.get(&self.url).header("User-Agent", USER_AGENT)
        })
        .await
        .context("VK page request failed")?;

        let html = response.text().await.context("VK page body unreadable")?;
        Ok(parse_page(&html))
    }
}

/// Extract a snapshot from the channel page HTML.
pub fn parse_page(html: &str) -> PlatformSnapshot {
    let mut snap = PlatformSnapshot::offline();

    let next_data = NEXT_DATA_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .and_then(|m| serde_json::from_str::<Value>(m.as_str().trim()).ok());

    if let Some(container) = next_data.as_ref().and_then(|data| find_stream_container(data, 0)) {
        let status = container["channelInfo"]["status"]
            .as_str()
            .unwrap_or_default()
            .to_uppercase();
        let info = &container["streamInfo"];

        snap.live = LIVE_STATUSES.contains(&status.as_str());
        snap.title = text(&info["title"]);
        snap.category = text(&info["category"]["title"]);
        snap.viewer_count = info["counters"]["viewers"].as_u64();
        snap.thumbnail_url = text(&info["previewUrl"]).or_else(|| text(&info["preview"]["url"]));

        // Some page states omit the status but still count viewers
        if snap.viewer_count.is_some_and(|v| v > 0) {
            snap.live = true;
        }
    }

    if snap.title.is_none() {
        snap.title = OG_TITLE_RE
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|t| !t.is_empty());
    }

    if !snap.live {
        // Only live snapshots carry content
        return PlatformSnapshot::offline();
    }
    snap
}

/// First object holding a `streamInfo` with a title, or a category and counters.
fn find_stream_container(value: &Value, depth: usize) -> Option<&Value> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(Value::Object(info)) = map.get("streamInfo") {
                if info.contains_key("title")
                    || (info.contains_key("category") && info.contains_key("counters"))
                {
                    return Some(value);
                }
            }
            map.values().find_map(|v| find_stream_container(v, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_stream_container(v, depth + 1)),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
