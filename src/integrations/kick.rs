use super::retry::{send_with_retry, RetryPolicy};
use super::{SourceAdapter, HTTP_CLIENT, USER_AGENT};
use crate::config::Config;
use crate::data::{Platform, PlatformSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Kick channel API: `GET {base}/api/v1/channels/{slug}`
pub struct KickSource {
    url: String,
    policy: RetryPolicy,
}

impl KickSource {
    pub fn new(config: &Config) -> Self {
        Self {
            url: format!(
                "{}/api/v1/channels/{}",
                config.sources.kick_api_base.trim_end_matches('/'),
                urlencoding::encode(&config.sources.kick_slug)
            ),
            policy: RetryPolicy::sources(&config.retry),
        }
    }
}

#[async_trait]
impl SourceAdapter for KickSource {
    fn platform(&self) -> Platform {
        Platform::Kick
    }

    async fn fetch(&self) -> Result<PlatformSnapshot> {
        let response = send_with_retry(&self.policy, "Kick channel fetch", || {
            HTTP_CLIENT
                .get(&self.url)
                .header("User-Agent", USER_AGENT)
                .header("Accept", "application/json,text/plain,*/*")
        })
        .await
        .context("Kick API request failed")?;

        let body: Value = response
            .json()
            .await
            .context("Kick API returned invalid JSON")?;

        Ok(parse_channel(&body))
    }
}

/// Map a channel response to a snapshot. A null or missing `livestream` means
/// offline.
pub fn parse_channel(body: &Value) -> PlatformSnapshot {
    let stream = &body["livestream"];
    if !stream.is_object() {
        return PlatformSnapshot::offline();
    }

    let live = stream["is_live"].as_bool().unwrap_or(false);
    if !live {
        return PlatformSnapshot::offline();
    }

    let viewer_count = stream["viewer_count"]
        .as_u64()
        .or_else(|| stream["viewers"].as_u64());

    let category = stream["categories"]
        .as_array()
        .and_then(|cats| cats.first())
        .and_then(|cat| non_empty(&cat["name"]));

    PlatformSnapshot {
        live,
        title: non_empty(&stream["session_title"]),
        category,
        viewer_count,
        session_token: non_empty(&stream["created_at"]),
        thumbnail_url: non_empty(&stream["thumbnail"]["url"]),
        playback_url: non_empty(&body["playback_url"]),
    }
}

fn non_empty(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_live_channel() {
        let body = json!({
            "slug": "streamer",
            "playback_url": "https://fa723fc1b171.us-west-2.playback.live-video.net/api/video/v1/x.m3u8",
            "livestream": {
                "is_live": true,
                "session_title": "  evening stream ",
                "viewer_count": 1234,
                "created_at": "2024-06-01 18:03:21",
                "categories": [{"name": "Just Chatting"}, {"name": "IRL"}],
                "thumbnail": {"url": "https://images.kick.com/thumb.jpg"}
            }
        });

        let snap = parse_channel(&body);
        assert!(snap.live);
        assert_eq!(snap.title.as_deref(), Some("evening stream"));
        assert_eq!(snap.category.as_deref(), Some("Just Chatting"));
        assert_eq!(snap.viewer_count, Some(1234));
        assert_eq!(snap.session_token.as_deref(), Some("2024-06-01 18:03:21"));
        assert_eq!(snap.thumbnail_url.as_deref(), Some("https://images.kick.com/thumb.jpg"));
        assert!(snap.playback_url.is_some());
    }

    #[test]
    fn test_parse_offline_channel() {
        assert_eq!(parse_channel(&json!({"livestream": null})), PlatformSnapshot::offline());
        assert_eq!(parse_channel(&json!({})), PlatformSnapshot::offline());
        assert_eq!(
            parse_channel(&json!({"livestream": {"is_live": false, "session_title": "old"}})),
            PlatformSnapshot::offline()
        );
    }

    #[test]
    fn test_parse_viewers_fallback_key() {
        let body = json!({"livestream": {"is_live": true, "viewers": 9, "categories": []}});
        let snap = parse_channel(&body);
        assert_eq!(snap.viewer_count, Some(9));
        assert!(snap.category.is_none());
        assert!(snap.title.is_none());
    }
}
