//! Notification dispatch: dedup windows, END once, main post upkeep

mod test_utils;

use chrono::Duration;
use onair::config::Config;
use onair::data::{ChangeField, Event, EventKind, FieldChange, PerPlatform, Platform};
use onair::notify::Dispatcher;
use onair::state::State;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;
use test_utils::{t, test_config, RecordingTransport, Sent, OPERATOR_ID};

fn setup() -> (Dispatcher, Arc<RecordingTransport>, TempDir) {
    let dir = TempDir::new().unwrap();
    let transport = RecordingTransport::new();
    let dispatcher = Dispatcher::new(transport.clone(), &test_config(dir.path()));
    (dispatcher, transport, dir)
}

fn start(key: &str) -> Event {
    Event::Start {
        session_key: key.to_string(),
        started_at: t(0),
    }
}

fn end(key: &str) -> Event {
    Event::End {
        session_key: key.to_string(),
        started_at: t(0),
        ended_at: t(3600),
        stats: None,
    }
}

fn title_change(to: &str) -> Event {
    Event::Change {
        changes: vec![FieldChange {
            platform: Platform::Kick,
            field: ChangeField::Title,
            from: Some("X".to_string()),
            to: to.to_string(),
        }],
    }
}

/// State as the engine leaves it right after a Kick session starts
fn live_state() -> State {
    let mut state = State::default();
    state.presence.any_live = true;
    state.presence.live = PerPlatform::new(true, false);
    state.presence.last_category = PerPlatform::new(Some("A".to_string()), None);
    state.presence.last_title = PerPlatform::new(Some("X".to_string()), None);
    state
}

mod start_events {
    use super::*;

    #[tokio::test]
    async fn test_start_posts_main_message() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = live_state();

        let report = dispatcher.dispatch(&mut state, &[start("s1")], t(0)).await;
        assert_eq!(report.forwarded, vec![EventKind::Start]);

        let texts = transport.group_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Kick: A"));
        assert_eq!(state.main_message_id, Some(100));
        assert_eq!(state.last_main_text.as_deref(), Some(texts[0].as_str()));
        assert_eq!(state.dedup.last_start_sent_at, Some(t(0)));
    }

    #[tokio::test]
    async fn test_start_inside_window_is_suppressed() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = live_state();

        dispatcher.dispatch(&mut state, &[start("s1")], t(0)).await;
        let report = dispatcher.dispatch(&mut state, &[start("s1")], t(600)).await;
        assert_eq!(report.suppressed, vec![EventKind::Start]);
        assert_eq!(transport.group_texts().len(), 1);

        let report = dispatcher.dispatch(&mut state, &[start("s2")], t(900)).await;
        assert_eq!(report.forwarded, vec![EventKind::Start]);
        assert_eq!(transport.group_texts().len(), 2);
    }

    #[tokio::test]
    async fn test_start_for_announced_session_keeps_main_post() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = live_state();

        dispatcher.dispatch(&mut state, &[start("s1")], t(0)).await;
        assert_eq!(state.main_session_key.as_deref(), Some("s1"));

        // Past the START window, the same session re-fires after a blip
        let report = dispatcher.dispatch(&mut state, &[start("s1")], t(1800)).await;
        assert_eq!(report.suppressed, vec![EventKind::Start]);
        assert_eq!(transport.group_texts().len(), 1);
        assert_eq!(state.main_message_id, Some(100));
        assert_eq!(state.dedup.last_start_sent_at, Some(t(0)));
    }

    #[tokio::test]
    async fn test_failed_send_still_records_attempt() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = live_state();
        transport.fail_sends.store(true, Ordering::SeqCst);

        let report = dispatcher.dispatch(&mut state, &[start("s1")], t(0)).await;
        assert_eq!(report.failed, vec![EventKind::Start]);
        assert_eq!(state.dedup.last_start_sent_at, Some(t(0)));
        assert!(state.main_message_id.is_none());

        // Transport recovered, but the window is still closed
        transport.fail_sends.store(false, Ordering::SeqCst);
        let report = dispatcher.dispatch(&mut state, &[start("s1")], t(30)).await;
        assert_eq!(report.suppressed, vec![EventKind::Start]);
        assert!(transport.sent().is_empty());
    }
}

mod change_events {
    use super::*;

    #[tokio::test]
    async fn test_change_window() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = State::default();

        dispatcher.dispatch(&mut state, &[title_change("Y")], t(0)).await;
        dispatcher.dispatch(&mut state, &[title_change("Z")], t(60)).await;
        dispatcher.dispatch(&mut state, &[title_change("W")], t(120)).await;

        let texts = transport.group_texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("Kick title: X → Y"));
        assert!(texts[1].contains("X → W"));
    }

    #[tokio::test]
    async fn test_partial_end_is_never_suppressed() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = State::default();
        let partial = Event::PartialEnd {
            stopped: Platform::Kick,
            continuing: Platform::Vk,
        };

        dispatcher.dispatch(&mut state, &[partial.clone()], t(0)).await;
        dispatcher.dispatch(&mut state, &[partial], t(1)).await;
        let texts = transport.group_texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("Kick stream ended, still live on VK:"));
    }
}

mod end_events {
    use super::*;

    #[tokio::test]
    async fn test_end_sent_once_per_session() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = State::default();

        let report = dispatcher.dispatch(&mut state, &[end("s1")], t(3600)).await;
        assert_eq!(report.forwarded, vec![EventKind::End]);
        let report = dispatcher.dispatch(&mut state, &[end("s1")], t(90_000)).await;
        assert_eq!(report.suppressed, vec![EventKind::End]);

        let texts = transport.group_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("⚫ Stream ended\nDuration: 01 h 00 min"));
        assert_eq!(state.dedup.last_end_session_key.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_end_retires_main_post() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = live_state();
        dispatcher.dispatch(&mut state, &[start("s1")], t(0)).await;
        assert!(state.main_message_id.is_some());

        state.presence.any_live = false;
        state.presence.live = PerPlatform::new(false, false);
        transport.fail_sends.store(true, Ordering::SeqCst);
        let report = dispatcher.dispatch(&mut state, &[end("s1")], t(3600)).await;

        assert_eq!(report.failed, vec![EventKind::End]);
        assert!(state.main_message_id.is_none());
        assert!(state.main_session_key.is_none());
        assert!(state.last_main_text.is_none());
        // Not retried for the same session
        assert_eq!(state.dedup.last_end_session_key.as_deref(), Some("s1"));
    }
}

mod main_post {
    use super::*;

    #[tokio::test]
    async fn test_main_post_edited_when_presence_changes() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = live_state();
        dispatcher.dispatch(&mut state, &[start("s1")], t(0)).await;

        // Nothing changed: no edit
        dispatcher.dispatch(&mut state, &[], t(30)).await;
        assert!(transport.edits().is_empty());

        state.presence.last_title.kick = Some("New title".to_string());
        dispatcher.dispatch(&mut state, &[], t(60)).await;
        let edits = transport.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].0, 100);
        assert!(edits[0].1.contains("New title"));
        assert_eq!(state.last_main_text.as_deref(), Some(edits[0].1.as_str()));
    }

    #[tokio::test]
    async fn test_failed_edit_posts_fresh_message() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = live_state();
        dispatcher.dispatch(&mut state, &[start("s1")], t(0)).await;
        transport.fail_edits.store(true, Ordering::SeqCst);

        state.presence.live.vk = true;
        state.presence.last_category.vk = Some("IRL".to_string());
        dispatcher.dispatch(&mut state, &[], t(30)).await;

        let texts = transport.group_texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[1].contains("VK: IRL"));
        assert_eq!(state.main_message_id, Some(101));
    }

    #[tokio::test]
    async fn test_no_main_post_upkeep_while_offline() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = State::default();
        state.main_message_id = Some(5);
        dispatcher.dispatch(&mut state, &[], t(0)).await;
        assert!(transport.sent().is_empty());
    }
}

mod operator_alerts {
    use super::*;

    #[tokio::test]
    async fn test_alerts_are_deduplicated_per_kind() {
        let (dispatcher, transport, _dir) = setup();
        let mut state = State::default();

        assert!(dispatcher.alert_operator(&mut state.dedup, "persist", "disk", t(0)).await);
        assert!(!dispatcher.alert_operator(&mut state.dedup, "persist", "disk", t(60)).await);
        assert!(dispatcher.alert_operator(&mut state.dedup, "conflict", "409", t(60)).await);
        let later = t(0) + Duration::seconds(1800);
        assert!(dispatcher.alert_operator(&mut state.dedup, "persist", "disk", later).await);

        let texts = transport.chat_texts(OPERATOR_ID);
        assert_eq!(texts, vec!["disk", "409", "disk"]);
        assert!(matches!(
            transport.sent()[0],
            Sent::Text {
                target: onair::integrations::Target::Chat(OPERATOR_ID),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_no_operator_means_no_alert() {
        let transport = RecordingTransport::new();
        let dispatcher = Dispatcher::new(transport.clone(), &Config::default());
        let mut state = State::default();
        assert!(!dispatcher.alert_operator(&mut state.dedup, "persist", "disk", t(0)).await);
        assert!(transport.sent().is_empty());
    }
}
