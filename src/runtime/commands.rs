//! Command channel: long-polls the control surface and answers commands.

use super::Runtime;
use crate::data::Platform;
use crate::integrations::capture::capture_frame;
use crate::integrations::{Photo, Target, TransportError, Update};
use crate::notify::format;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause after a non-conflict poll error
const ERROR_BACKOFF: Duration = Duration::from_secs(3);

const OPERATOR_ONLY: &str = "This command is only available to the operator.";

pub async fn run(rt: Arc<Runtime>, shutdown: CancellationToken) -> Result<()> {
    let wait = Duration::from_secs(rt.config.command.long_poll_secs);

    loop {
        // Only the long poll is raced against restart and shutdown; batch
        // handling below always runs to completion.
        let polled = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = rt.command_restart.notified() => {
                tracing::info!("Command poll restarted by watchdog");
                continue;
            }
            polled = rt.poll_commands(wait) => polled,
        };

        let backoff = match polled {
            Ok(updates) => {
                rt.handle_batch(updates, Utc::now()).await;
                continue;
            }
            Err(TransportError::Conflict) => {
                rt.on_conflict(Utc::now()).await;
                Duration::from_secs(rt.config.command.conflict_backoff_secs)
            }
            Err(e) => {
                tracing::warn!("Command poll failed: {}", e);
                ERROR_BACKOFF
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

impl Runtime {
    /// Long-poll for the next batch. With no stored cursor, whatever is
    /// pending is dropped first so stale commands are not replayed.
    pub async fn poll_commands(&self, wait: Duration) -> Result<Vec<Update>, TransportError> {
        let stored = self.state.lock().await.cursor.next_update_offset;
        let offset = match stored {
            Some(offset) => Some(offset),
            None => {
                let next = self.commands.drop_pending().await?;
                if let Some(next) = next {
                    tracing::info!(offset = next, "Dropped pending commands");
                    let mut state = self.state.lock().await;
                    if state.cursor.next_update_offset.is_none() {
                        state.cursor.next_update_offset = Some(next);
                        self.persist(&mut state, Utc::now()).await;
                    }
                }
                next
            }
        };
        self.commands.poll(offset, wait).await
    }

    /// Record a successful poll, advance the cursor past the batch, then
    /// answer each command. The cursor moves first so a failing reply can
    /// never make the batch replay.
    pub async fn handle_batch(&self, updates: Vec<Update>, now: DateTime<Utc>) {
        {
            let mut state = self.state.lock().await;
            state.cursor.last_poll_at = Some(now);
            if state.cursor.advance_past(updates.iter().map(|u| u.update_id)) {
                if updates.iter().any(|u| u.command.is_some()) {
                    state.cursor.last_command_seen_at = Some(now);
                }
                self.persist(&mut state, now).await;
            }
        }

        for update in &updates {
            self.handle_command(update, now).await;
        }
    }

    /// Alert the operator that another poller holds the channel.
    pub async fn on_conflict(&self, now: DateTime<Utc>) {
        tracing::warn!("Another poller is reading commands with this bot token");
        let mut state = self.state.lock().await;
        let text = "⚠️ Command polling conflict: another instance is using this bot token.";
        if self.dispatcher.alert_operator(&mut state.dedup, "conflict", text, now).await {
            self.persist(&mut state, now).await;
        }
    }

    /// Replies go back where the command was posted, including its forum topic.
    fn reply_target(&self, update: &Update) -> Option<Target> {
        match update.chat_id? {
            id if id == self.config.telegram.group_id => Some(Target::GroupTopic(update.thread_id)),
            id => Some(Target::Chat(id)),
        }
    }

    async fn reply(&self, target: Target, text: &str) {
        if let Err(e) = self.dispatcher.transport().send_text(target, text).await {
            tracing::warn!("Failed to send command reply: {}", e);
        }
    }

    async fn handle_command(&self, update: &Update, now: DateTime<Utc>) {
        let Some(command) = update.command.as_deref() else {
            return;
        };
        let Some(target) = self.reply_target(update) else {
            return;
        };
        tracing::info!(command, from = ?update.from_id, "Command received");

        match command {
            "status" => self.reply_status(target, now).await,
            "stats" => {
                let text = {
                    let state = self.state.lock().await;
                    format::stats_text(state.session_stats.as_ref(), now)
                };
                self.reply(target, &text).await;
            }
            "help" | "start" => self.reply(target, &format::help_text()).await,
            "diag" | "reset" if !self.dispatcher.is_operator(update.from_id) => {
                tracing::warn!(command, from = ?update.from_id, "Operator command refused");
                self.reply(target, OPERATOR_ONLY).await;
            }
            "diag" => {
                let text = {
                    let state = self.state.lock().await;
                    format::diag_text(
                        &state,
                        &self.store.path().display().to_string(),
                        self.started_at,
                        now,
                    )
                };
                self.reply(target, &text).await;
            }
            "reset" => {
                {
                    let mut state = self.state.lock().await;
                    state.reset_keeping_cursor();
                    self.persist(&mut state, now).await;
                }
                tracing::warn!("State reset by operator");
                self.reply(target, "State reset.").await;
            }
            other => tracing::debug!(command = other, "Ignoring unknown command"),
        }
    }

    /// Presence reply with the best picture available: a captured frame, the
    /// platform thumbnail, or text alone.
    async fn reply_status(&self, target: Target, now: DateTime<Utc>) {
        let snaps = self.current_snapshots(now).await;
        let text = format::status_text(&snaps, self.dispatcher.links());

        let live: Vec<Platform> = Platform::ALL.into_iter().filter(|p| snaps[*p].live).collect();
        if live.is_empty() {
            self.reply(target, &text).await;
            return;
        }

        let mut photo = None;
        if self.config.capture.enabled {
            for platform in &live {
                let Some(url) = snaps[*platform].playback_url.as_deref() else {
                    continue;
                };
                match capture_frame(&self.config.capture, url).await {
                    Ok(bytes) => {
                        photo = Some(Photo::Bytes(bytes));
                        break;
                    }
                    Err(e) => tracing::warn!(platform = %platform, "Frame capture failed: {:#}", e),
                }
            }
        }
        if photo.is_none() {
            photo = live
                .iter()
                .find_map(|p| snaps[*p].thumbnail_url.clone())
                .map(Photo::Url);
        }

        let Some(photo) = photo else {
            self.reply(target, &text).await;
            return;
        };
        if let Err(e) = self.dispatcher.transport().send_photo(target, photo, &text).await {
            tracing::warn!("Failed to send status photo, falling back to text: {}", e);
            self.reply(target, &text).await;
        }
    }
}
