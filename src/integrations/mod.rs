pub mod capture;
pub mod kick;
pub mod retry;
pub mod telegram;
pub mod vk;

use crate::config::Config;
use crate::data::{PerPlatform, Platform, PlatformSnapshot};
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;

pub use retry::{RetryPolicy, TransportError};

/// Shared HTTP client for all outbound requests to enable connection pooling
pub static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(5)
        .build()
        .expect("Failed to create HTTP client")
});

/// Browser user agent; both platforms reject obvious bots
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Reads one platform's live status.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    async fn fetch(&self) -> Result<PlatformSnapshot>;
}

/// Fetch a snapshot, treating any failure as offline for this tick.
pub async fn fetch_or_offline(adapter: &dyn SourceAdapter) -> PlatformSnapshot {
    match adapter.fetch().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(platform = %adapter.platform(), "Source fetch failed, treating as offline: {:#}", e);
            PlatformSnapshot::offline()
        }
    }
}

/// Fetch both platforms concurrently.
pub async fn fetch_all(sources: &PerPlatform<Arc<dyn SourceAdapter>>) -> PerPlatform<PlatformSnapshot> {
    let (kick, vk) = tokio::join!(
        fetch_or_offline(sources.kick.as_ref()),
        fetch_or_offline(sources.vk.as_ref())
    );
    PerPlatform::new(kick, vk)
}

/// Production adapters for both platforms
pub fn sources_from_config(config: &Config) -> PerPlatform<Arc<dyn SourceAdapter>> {
    PerPlatform::new(
        Arc::new(kick::KickSource::new(config)) as Arc<dyn SourceAdapter>,
        Arc::new(vk::VkSource::new(config)) as Arc<dyn SourceAdapter>,
    )
}

/// Where an outbound message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The configured group (and topic thread, if any)
    Group,
    /// The group, in a given forum topic (`None` is the general topic)
    GroupTopic(Option<i64>),
    /// A direct chat: operator alerts and command replies
    Chat(i64),
}

pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Photo {
    Url(String),
    /// JPEG bytes, uploaded as multipart
    Bytes(Vec<u8>),
}

/// Outbound notification sink. Every call is best effort.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, target: Target, text: &str) -> Result<MessageId, TransportError>;

    async fn send_photo(
        &self,
        target: Target,
        photo: Photo,
        caption: &str,
    ) -> Result<MessageId, TransportError>;

    async fn edit_text(
        &self,
        target: Target,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), TransportError>;
}

/// One entry read from the command channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    /// Normalized command name without slash, bot suffix or arguments
    pub command: Option<String>,
    pub from_id: Option<i64>,
    pub chat_id: Option<i64>,
    /// Forum topic the message was posted in
    pub thread_id: Option<i64>,
}

/// Long-poll reader of the control surface.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Wait up to `wait` for updates at or after `offset`.
    async fn poll(&self, offset: Option<i64>, wait: Duration) -> Result<Vec<Update>, TransportError>;

    /// Discard everything pending. Returns the offset that follows the
    /// discarded updates, or `None` when nothing was pending.
    async fn drop_pending(&self) -> Result<Option<i64>, TransportError>;
}
