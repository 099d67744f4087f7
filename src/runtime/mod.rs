//! Long-running service: poll loop, command channel and watchdog sharing one
//! locked [`State`].
//!
//! Every read-modify-write of the state (including the save) happens under
//! the state mutex. Network waits that can be long (source fetches, the
//! command long poll, frame capture) happen outside it.

pub mod commands;
pub mod poll_loop;
pub mod supervisor;
pub mod watchdog;

use crate::config::Config;
use crate::data::{PerPlatform, PlatformSnapshot};
use crate::engine::{self, EngineConfig};
use crate::integrations::telegram::TelegramClient;
use crate::integrations::{self, CommandSource, SourceAdapter, Transport};
use crate::notify::{DispatchReport, Dispatcher};
use crate::state::{State, StateStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Pause before a crashed task is started again
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Last snapshots seen by the poll loop, reused by `/status`
#[derive(Debug, Clone)]
struct CachedSnapshots {
    at: DateTime<Utc>,
    snaps: PerPlatform<PlatformSnapshot>,
}

pub struct Runtime {
    config: Arc<Config>,
    state: Arc<Mutex<State>>,
    store: StateStore,
    sources: PerPlatform<Arc<dyn SourceAdapter>>,
    commands: Arc<dyn CommandSource>,
    dispatcher: Dispatcher,
    engine: EngineConfig,
    snapshots: RwLock<Option<CachedSnapshots>>,
    /// Wakes the command loop to re-read its cursor after a watchdog recovery
    command_restart: Notify,
    started_at: DateTime<Utc>,
}

impl Runtime {
    pub fn new(
        config: Config,
        store: StateStore,
        sources: PerPlatform<Arc<dyn SourceAdapter>>,
        transport: Arc<dyn Transport>,
        commands: Arc<dyn CommandSource>,
    ) -> Self {
        let removed = store.cleanup();
        if removed > 0 {
            tracing::info!("Removed {} stale temp files next to {}", removed, store.path().display());
        }
        let state = store.load();

        Self {
            engine: EngineConfig::from_config(&config),
            dispatcher: Dispatcher::new(transport, &config),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
            store,
            sources,
            commands,
            snapshots: RwLock::new(None),
            command_restart: Notify::new(),
            started_at: Utc::now(),
        }
    }

    /// Wire the production collaborators.
    pub fn from_config(config: Config) -> Result<Self> {
        let store = StateStore::from_config(&config)?;
        let telegram = Arc::new(TelegramClient::new(&config));
        let sources = integrations::sources_from_config(&config);
        Ok(Self::new(config, store, sources, telegram.clone(), telegram))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<Mutex<State>> {
        &self.state
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// One poll tick: fetch both platforms, advance the engine, dispatch and
    /// persist.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> DispatchReport {
        let snaps = integrations::fetch_all(&self.sources).await;
        self.cache_snapshots(now, &snaps);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let events = engine::step(
            &mut state.presence,
            &mut state.session_stats,
            &snaps.kick,
            &snaps.vk,
            &self.engine,
            now,
        );
        for event in &events {
            tracing::info!(event = event.kind().as_str(), "Presence transition");
        }

        let report = self.dispatcher.dispatch(state, &events, now).await;
        self.persist(state, now).await;
        tracing::debug!(
            kick = snaps.kick.live,
            vk = snaps.vk.live,
            forwarded = report.forwarded.len(),
            suppressed = report.suppressed.len(),
            failed = report.failed.len(),
            "Tick complete"
        );
        report
    }

    /// Save the state; failures alert the operator and are otherwise
    /// swallowed, so the in-memory state stays authoritative.
    pub(crate) async fn persist(&self, state: &mut State, now: DateTime<Utc>) {
        let Err(e) = self.store.save(state) else {
            return;
        };
        let detail = match std::error::Error::source(&e) {
            Some(source) => format!("{}: {}", e, source),
            None => e.to_string(),
        };
        tracing::error!("Failed to persist state: {}", detail);
        let kind = if e.is_no_space() { "no_space" } else { "persist" };
        let text = format!("⚠️ State could not be saved: {}", detail);
        self.dispatcher.alert_operator(&mut state.dedup, kind, &text, now).await;
    }

    fn cache_snapshots(&self, now: DateTime<Utc>, snaps: &PerPlatform<PlatformSnapshot>) {
        let mut cache = self.snapshots.write().unwrap_or_else(|p| p.into_inner());
        *cache = Some(CachedSnapshots {
            at: now,
            snaps: snaps.clone(),
        });
    }

    /// Snapshots no older than two poll intervals, fetching fresh ones
    /// otherwise. Never called with the state lock held.
    pub async fn current_snapshots(&self, now: DateTime<Utc>) -> PerPlatform<PlatformSnapshot> {
        let max_age = chrono::Duration::seconds(2 * self.config.polling.interval_secs as i64);
        let cached = self
            .snapshots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .filter(|c| now - c.at <= max_age);

        match cached {
            Some(c) => c.snaps,
            None => {
                let snaps = integrations::fetch_all(&self.sources).await;
                self.cache_snapshots(now, &snaps);
                snaps
            }
        }
    }

    /// Run all tasks until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            kick = %self.config.sources.kick_slug,
            vk = %self.config.sources.vk_slug,
            interval_secs = self.config.polling.interval_secs,
            state = %self.store.path().display(),
            "Watcher started"
        );

        let mut tasks = Vec::new();

        let rt = self.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(supervisor::supervise(
            "poll loop",
            shutdown.clone(),
            RESTART_DELAY,
            move || poll_loop::run(rt.clone(), token.clone()),
        )));

        if self.config.command.enabled {
            let rt = self.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(supervisor::supervise(
                "command channel",
                shutdown.clone(),
                RESTART_DELAY,
                move || commands::run(rt.clone(), token.clone()),
            )));

            let rt = self.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(supervisor::supervise(
                "watchdog",
                shutdown.clone(),
                RESTART_DELAY,
                move || watchdog::run(rt.clone(), token.clone()),
            )));
        } else {
            tracing::info!("Command channel disabled");
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("Supervisor task failed: {}", e);
            }
        }

        let mut state = self.state.lock().await;
        self.persist(&mut state, Utc::now()).await;
        tracing::info!("Watcher stopped");
        Ok(())
    }
}
