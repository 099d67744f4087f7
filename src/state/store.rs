//! Durable storage for [`State`].
//!
//! Writes go to a temporary sibling, are fsynced, then renamed over the
//! canonical path, all under an exclusive lock on `<path>.lock`. Loading never
//! fails: a missing, unreadable, truncated or oversized file falls back to
//! defaults.

use super::{State, STATE_VERSION};
use crate::config::Config;
use anyhow::Result;
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Keys kept when an oversized file is salvaged. Enough to not re-announce
/// a live session or re-send an END after a restart.
pub const SAFELIST: &[&str] = &[
    "version",
    "any_live",
    "live",
    "session_started_at",
    "session_token",
    "offline_streak",
    "offline_since",
    "end_notified_for_session",
    "last_start_sent_at",
    "last_change_sent_at",
    "last_end_session_key",
    "next_update_offset",
    "main_message_id",
    "main_session_key",
];

/// Files beyond this multiple of the size limit are not even parsed
const SALVAGE_READ_FACTOR: u64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no space left to write {path} (after cleanup)")]
    NoSpace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize state")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_no_space(&self) -> bool {
        matches!(self, StoreError::NoSpace { .. })
    }
}

/// Puts serialized state on disk: `content` goes to `temp`, which then
/// replaces `path`. Called with the exclusive lock held.
pub trait StateWriter: Send + Sync + fmt::Debug {
    fn write(&self, temp: &Path, path: &Path, content: &[u8]) -> io::Result<()>;
}

/// Write, fsync, rename, then fsync the directory
#[derive(Debug, Default)]
pub struct FsWriter;

impl StateWriter for FsWriter {
    fn write(&self, temp: &Path, path: &Path, content: &[u8]) -> io::Result<()> {
        {
            let mut file = File::create(temp)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(temp, path)?;

        #[cfg(unix)]
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    max_bytes: u64,
    writer: Arc<dyn StateWriter>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self::with_writer(path, max_bytes, Arc::new(FsWriter))
    }

    pub fn with_writer(path: impl Into<PathBuf>, max_bytes: u64, writer: Arc<dyn StateWriter>) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            writer,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.state_path()?, config.state.max_bytes))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, ".lock")
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, &format!(".tmp.{}", std::process::id()))
    }

    /// Load the state, applying defaults to anything missing or unreadable.
    pub fn load(&self) -> State {
        match self.try_load() {
            Ok(Some(state)) => state,
            Ok(None) => State::default(),
            Err(e) => {
                tracing::warn!("Failed to read state from {}: {}", self.path.display(), e);
                State::default()
            }
        }
    }

    fn try_load(&self) -> io::Result<Option<State>> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let oversized = meta.len() > self.max_bytes;
        if oversized && meta.len() > self.max_bytes.saturating_mul(SALVAGE_READ_FACTOR) {
            tracing::warn!(
                "State file {} is {} bytes (limit {}), starting from defaults",
                self.path.display(),
                meta.len(),
                self.max_bytes
            );
            return Ok(None);
        }

        let content = self.read_locked()?;
        if content.trim().is_empty() {
            return Ok(None);
        }

        let mut value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "State file {} is corrupt ({}), starting from defaults",
                    self.path.display(),
                    e
                );
                return Ok(None);
            }
        };

        if oversized {
            tracing::warn!(
                "State file {} is {} bytes (limit {}), keeping safelisted fields only",
                self.path.display(),
                meta.len(),
                self.max_bytes
            );
            value = filter_safelist(value);
        }

        Ok(Some(state_from_value(value)))
    }

    fn read_locked(&self) -> io::Result<String> {
        let lock = self.open_lock_file()?;
        lock.lock_shared()?;

        let mut content = String::new();
        let result = File::open(&self.path).and_then(|mut f| f.read_to_string(&mut content));

        lock.unlock()?;
        result.map(|_| content)
    }

    fn open_lock_file(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
    }

    /// Atomically replace the stored state.
    ///
    /// A "no space" failure triggers one cleanup pass and one retry.
    pub fn save(&self, state: &State) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(state)?;
        if content.len() as u64 > self.max_bytes {
            tracing::warn!(
                "Serialized state is {} bytes, above the {} byte load limit",
                content.len(),
                self.max_bytes
            );
        }

        match self.write_atomic(&content) {
            Ok(()) => Ok(()),
            Err(e) if is_no_space(&e) => {
                let removed = self.cleanup();
                tracing::warn!(
                    "No space writing {} ({}), removed {} stale files, retrying once",
                    self.path.display(),
                    e,
                    removed
                );
                self.write_atomic(&content).map_err(|source| {
                    if is_no_space(&source) {
                        StoreError::NoSpace {
                            path: self.path.clone(),
                            source,
                        }
                    } else {
                        StoreError::Io {
                            path: self.path.clone(),
                            source,
                        }
                    }
                })
            }
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_atomic(&self, content: &[u8]) -> io::Result<()> {
        let lock = self.open_lock_file()?;
        lock.lock_exclusive()?;

        let result = self.writer.write(&self.temp_path(), &self.path, content);
        if result.is_err() {
            let _ = fs::remove_file(self.temp_path());
        }

        lock.unlock()?;
        result
    }

    /// Remove temp files left behind by interrupted writes. Returns how many
    /// were removed.
    pub fn cleanup(&self) -> usize {
        let Some(file_name) = self.path.file_name().and_then(|n| n.to_str()) else {
            return 0;
        };
        let prefix = format!("{}.tmp.", file_name);
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(d) => d.to_path_buf(),
            None => PathBuf::from("."),
        };
        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub fn is_no_space(e: &io::Error) -> bool {
    // 28 is ENOSPC, 122 is EDQUOT on Linux
    e.kind() == io::ErrorKind::StorageFull || matches!(e.raw_os_error(), Some(28) | Some(122))
}

/// Keep only [`SAFELIST`] keys of a raw state object.
pub fn filter_safelist(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(k, _)| SAFELIST.contains(&k.as_str()))
                .collect(),
        ),
        _ => serde_json::Value::Object(Default::default()),
    }
}

fn state_from_value(value: serde_json::Value) -> State {
    match serde_json::from_value::<State>(value.clone()) {
        Ok(mut state) => {
            if state.version != STATE_VERSION {
                tracing::warn!(
                    "State version mismatch (expected {}, got {}), loading with defaults",
                    STATE_VERSION,
                    state.version
                );
                state.version = STATE_VERSION;
            }
            state
        }
        Err(e) => {
            // A field with the wrong type; salvage what the safelist allows
            tracing::warn!("State does not match schema ({}), keeping safelisted fields", e);
            serde_json::from_value(filter_safelist(value)).unwrap_or_default()
        }
    }
}
