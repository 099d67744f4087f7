//! Notification dispatch.
//!
//! Decides which engine events are forwarded (dedup windows, END once per
//! session), renders them and hands them to the transport. Sends are best
//! effort: a failed send still counts as attempted, so dedup state advances
//! either way.

pub mod format;

use crate::config::Config;
use crate::data::{Event, EventKind};
use crate::integrations::{Target, Transport};
use crate::state::{window_open, DedupWindows, State};
use chrono::{DateTime, Duration, Utc};
use format::Links;
use std::sync::Arc;

/// What happened to each event of a tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub forwarded: Vec<EventKind>,
    pub suppressed: Vec<EventKind>,
    pub failed: Vec<EventKind>,
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    links: Links,
    start_window: Duration,
    change_window: Duration,
    alert_window: Duration,
    operator_id: Option<i64>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self {
            transport,
            links: Links::from_config(&config.sources),
            start_window: Duration::seconds(config.dedup.start_window_secs as i64),
            change_window: Duration::seconds(config.dedup.change_window_secs as i64),
            alert_window: Duration::seconds(config.dedup.alert_window_secs as i64),
            operator_id: config.telegram.operator_id,
        }
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Gate an event against the dedup windows, recording the attempt when
    /// it passes.
    pub fn admit(&self, dedup: &mut DedupWindows, event: &Event, now: DateTime<Utc>) -> bool {
        match event {
            Event::Start { .. } => {
                if !window_open(dedup.last_start_sent_at, self.start_window, now) {
                    return false;
                }
                dedup.last_start_sent_at = Some(now);
                true
            }
            Event::Change { .. } => {
                if !window_open(dedup.last_change_sent_at, self.change_window, now) {
                    return false;
                }
                dedup.last_change_sent_at = Some(now);
                true
            }
            Event::PartialEnd { .. } => true,
            Event::End { session_key, .. } => {
                if dedup.last_end_session_key.as_deref() == Some(session_key.as_str()) {
                    return false;
                }
                dedup.last_end_session_key = Some(session_key.clone());
                true
            }
        }
    }

    /// Forward a tick's events, then keep the main post in step with the
    /// current presence.
    pub async fn dispatch(&self, state: &mut State, events: &[Event], now: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for event in events {
            let kind = event.kind();
            if self.resumes_main_post(state, event) {
                tracing::info!(event = kind.as_str(), "Session resumed, keeping the main post");
                report.suppressed.push(kind);
                continue;
            }
            if !self.admit(&mut state.dedup, event, now) {
                tracing::info!(event = kind.as_str(), "Notification suppressed by dedup");
                report.suppressed.push(kind);
                continue;
            }

            let sent = match event {
                Event::Start { session_key, .. } => {
                    let text = format::main_text(&state.presence, &self.links);
                    match self.transport.send_text(Target::Group, &text).await {
                        Ok(id) => {
                            tracing::info!(session = %session_key, message_id = id, "Session start announced");
                            state.main_message_id = Some(id);
                            state.main_session_key = Some(session_key.clone());
                            state.last_main_text = Some(text);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Event::Change { changes } => self
                    .transport
                    .send_text(Target::Group, &format::change_text(changes))
                    .await
                    .map(|_| ()),
                Event::PartialEnd { stopped, continuing } => self
                    .transport
                    .send_text(
                        Target::Group,
                        &format::partial_end_text(*stopped, *continuing, &self.links),
                    )
                    .await
                    .map(|_| ()),
                Event::End {
                    session_key,
                    started_at,
                    ended_at,
                    stats,
                } => {
                    let text = format::end_text(*started_at, *ended_at, stats.as_deref(), &self.links);
                    // The main post belongs to the finished session whatever the send outcome
                    state.main_message_id = None;
                    state.main_session_key = None;
                    state.last_main_text = None;
                    let result = self.transport.send_text(Target::Group, &text).await.map(|_| ());
                    if result.is_ok() {
                        tracing::info!(session = %session_key, "Session end announced");
                    }
                    result
                }
            };

            match sent {
                Ok(()) => report.forwarded.push(kind),
                Err(e) => {
                    tracing::warn!(event = kind.as_str(), "Failed to send notification: {}", e);
                    report.failed.push(kind);
                }
            }
        }

        if state.presence.any_live {
            self.refresh_main_post(state).await;
        }
        report
    }

    /// A START for the session whose main post is still up. A brief offline
    /// blip re-fires the edge; the existing post is kept and edited instead.
    fn resumes_main_post(&self, state: &State, event: &Event) -> bool {
        match event {
            Event::Start { session_key, .. } => {
                state.main_message_id.is_some()
                    && state.main_session_key.as_deref() == Some(session_key.as_str())
            }
            _ => false,
        }
    }

    /// Edit the main post when its rendered text changed. A failed edit is
    /// replaced by a fresh post.
    pub async fn refresh_main_post(&self, state: &mut State) {
        let Some(message_id) = state.main_message_id else {
            return;
        };
        let text = format::main_text(&state.presence, &self.links);
        if state.last_main_text.as_deref() == Some(text.as_str()) {
            return;
        }

        if let Err(e) = self.transport.edit_text(Target::Group, message_id, &text).await {
            tracing::warn!(message_id, "Failed to edit main post, sending a new one: {}", e);
            match self.transport.send_text(Target::Group, &text).await {
                Ok(id) => state.main_message_id = Some(id),
                Err(e) => tracing::warn!("Failed to resend main post: {}", e),
            }
        }
        state.last_main_text = Some(text);
    }

    /// Send a deduplicated alert to the operator. Returns whether it was sent.
    pub async fn alert_operator(
        &self,
        dedup: &mut DedupWindows,
        kind: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(operator) = self.operator_id else {
            tracing::warn!(kind, "No operator configured for alert: {}", text);
            return false;
        };
        if !dedup.should_alert(kind, self.alert_window, now) {
            tracing::debug!(kind, "Operator alert suppressed by dedup");
            return false;
        }
        match self.transport.send_text(Target::Chat(operator), text).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(kind, "Failed to alert operator: {}", e);
                false
            }
        }
    }

    pub fn is_operator(&self, user_id: Option<i64>) -> bool {
        matches!((self.operator_id, user_id), (Some(op), Some(id)) if op == id)
    }

    pub fn operator_id(&self) -> Option<i64> {
        self.operator_id
    }
}
