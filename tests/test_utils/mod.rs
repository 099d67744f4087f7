//! Test utilities and fakes for onair tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use onair::config::Config;
use onair::data::{PerPlatform, Platform, PlatformSnapshot};
use onair::integrations::{
    CommandSource, MessageId, Photo, SourceAdapter, Target, Transport, TransportError, Update,
};
use onair::runtime::Runtime;
use onair::state::{FsWriter, StateStore, StateWriter};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const GROUP_ID: i64 = -100_500;
pub const OPERATOR_ID: i64 = 42;

/// Fixed test clock: 2024-06-01 12:00:00 UTC plus `secs`
pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

pub fn live(category: &str, title: &str) -> PlatformSnapshot {
    PlatformSnapshot::live(category, title)
}

pub fn off() -> PlatformSnapshot {
    PlatformSnapshot::offline()
}

/// Config suitable for runtime tests: valid credentials, an operator, and
/// the state file inside `dir`.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.telegram.bot_token = "123:test".to_string();
    config.telegram.group_id = GROUP_ID;
    config.telegram.operator_id = Some(OPERATOR_ID);
    config.state.path = Some(dir.join("state.json"));
    config
}

/// Source whose next answer is set by the test
pub struct FakeSource {
    platform: Platform,
    next: Mutex<Result<PlatformSnapshot, String>>,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            next: Mutex::new(Ok(PlatformSnapshot::offline())),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, snapshot: PlatformSnapshot) {
        *self.next.lock().unwrap() = Ok(snapshot);
    }

    pub fn fail(&self, message: &str) {
        *self.next.lock().unwrap() = Err(message.to_string());
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self) -> anyhow::Result<PlatformSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.next.lock().unwrap().clone().map_err(|e| anyhow::anyhow!(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        target: Target,
        id: MessageId,
        text: String,
    },
    Photo {
        target: Target,
        photo: Photo,
        caption: String,
    },
    Edit {
        target: Target,
        id: MessageId,
        text: String,
    },
}

/// Writer on a full disk: the first `failures` writes fail with ENOSPC,
/// later ones go to the real filesystem.
#[derive(Debug)]
pub struct FullDisk {
    failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FullDisk {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        })
    }
}

impl StateWriter for FullDisk {
    fn write(&self, temp: &Path, path: &Path, content: &[u8]) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::from_raw_os_error(28));
        }
        FsWriter.write(temp, path, content)
    }
}

/// Transport that records every call and can be told to fail
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Sent>>,
    pub fail_sends: AtomicBool,
    pub fail_edits: AtomicBool,
    pub fail_photos: AtomicBool,
    next_id: AtomicI64,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(100),
            ..Default::default()
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Texts successfully sent to the group, in order
    pub fn group_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text {
                    target: Target::Group,
                    text,
                    ..
                } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Texts sent to a forum topic of the group (`None` is the general topic)
    pub fn topic_texts(&self, thread: Option<i64>) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text {
                    target: Target::GroupTopic(t),
                    text,
                    ..
                } if t == thread => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Texts sent to a direct chat
    pub fn chat_texts(&self, chat: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { target, text, .. } if target == Target::Chat(chat) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<(MessageId, String)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Edit { id, text, .. } => Some((id, text)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

fn unavailable() -> TransportError {
    TransportError::Status {
        code: 502,
        body: "bad gateway".to_string(),
        retry_after: None,
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, target: Target, text: &str) -> Result<MessageId, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(Sent::Text {
            target,
            id,
            text: text.to_string(),
        });
        Ok(id)
    }

    async fn send_photo(
        &self,
        target: Target,
        photo: Photo,
        caption: &str,
    ) -> Result<MessageId, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) || self.fail_photos.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.sent.lock().unwrap().push(Sent::Photo {
            target,
            photo,
            caption: caption.to_string(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn edit_text(
        &self,
        target: Target,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), TransportError> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(TransportError::Api("message to edit not found".to_string()));
        }
        self.sent.lock().unwrap().push(Sent::Edit {
            target,
            id: message_id,
            text: text.to_string(),
        });
        Ok(())
    }
}

/// Command source replaying a queue of poll results
#[derive(Default)]
pub struct ScriptedCommands {
    polls: Mutex<VecDeque<Result<Vec<Update>, TransportError>>>,
    pub offsets: Mutex<Vec<Option<i64>>>,
    pub pending_offset: Mutex<Option<i64>>,
    pub drops: AtomicUsize,
}

impl ScriptedCommands {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, result: Result<Vec<Update>, TransportError>) {
        self.polls.lock().unwrap().push_back(result);
    }

    pub fn offsets(&self) -> Vec<Option<i64>> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandSource for ScriptedCommands {
    async fn poll(
        &self,
        offset: Option<i64>,
        _wait: std::time::Duration,
    ) -> Result<Vec<Update>, TransportError> {
        self.offsets.lock().unwrap().push(offset);
        self.polls.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn drop_pending(&self) -> Result<Option<i64>, TransportError> {
        self.drops.fetch_add(1, Ordering::SeqCst);
        Ok(*self.pending_offset.lock().unwrap())
    }
}

pub fn command(update_id: i64, name: &str, from: i64, chat: i64) -> Update {
    Update {
        update_id,
        command: Some(name.to_string()),
        from_id: Some(from),
        chat_id: Some(chat),
        thread_id: None,
    }
}

/// A command posted in a forum topic of the group
pub fn topic_command(update_id: i64, name: &str, from: i64, thread: i64) -> Update {
    Update {
        thread_id: Some(thread),
        ..command(update_id, name, from, GROUP_ID)
    }
}

/// A runtime wired to fakes
pub struct Harness {
    pub runtime: Runtime,
    pub kick: Arc<FakeSource>,
    pub vk: Arc<FakeSource>,
    pub transport: Arc<RecordingTransport>,
    pub commands: Arc<ScriptedCommands>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let store = StateStore::new(
            config.state.path.clone().expect("test config sets a state path"),
            config.state.max_bytes,
        );
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: StateStore) -> Self {
        let kick = FakeSource::new(Platform::Kick);
        let vk = FakeSource::new(Platform::Vk);
        let transport = RecordingTransport::new();
        let commands = ScriptedCommands::new();
        let runtime = Runtime::new(
            config,
            store,
            PerPlatform::new(
                kick.clone() as Arc<dyn SourceAdapter>,
                vk.clone() as Arc<dyn SourceAdapter>,
            ),
            transport.clone(),
            commands.clone(),
        );
        Self {
            runtime,
            kick,
            vk,
            transport,
            commands,
        }
    }

    pub fn set(&self, kick: PlatformSnapshot, vk: PlatformSnapshot) {
        self.kick.set(kick);
        self.vk.set(vk);
    }
}
